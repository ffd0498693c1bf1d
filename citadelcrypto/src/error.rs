use std::error::Error;

#[derive(Debug)]
pub enum CryptoError {
	/// A cipher name outside the supported set, or an empty/mismatched cascade list.
	InvalidAlgorithm,
	/// Decryption produced a malformed padding or an impossible length.
	CipherIntegrity,
	/// Truncated data was provided.
	TruncatedData,
	/// Unsupported format version.
	UnsupportedVersion,
	/// IO error.
	IOError(std::io::Error),
}

impl From<std::io::Error> for CryptoError {
	fn from(e: std::io::Error) -> Self {
		CryptoError::IOError(e)
	}
}

impl Error for CryptoError {}

impl std::fmt::Display for CryptoError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			CryptoError::InvalidAlgorithm => write!(f, "Invalid cipher algorithm"),
			CryptoError::CipherIntegrity => write!(f, "Cipher integrity error"),
			CryptoError::TruncatedData => write!(f, "Truncated data"),
			CryptoError::UnsupportedVersion => write!(f, "Unsupported version"),
			CryptoError::IOError(e) => write!(f, "IO error: {e}"),
		}
	}
}
