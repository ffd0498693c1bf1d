use citadelcrypto::CryptoError;


#[derive(Debug)]
pub enum VaultError {
	Io(std::io::Error),
	Serialization(serde_json::Error),
	Crypto(CryptoError),
	/// A store file violated its structural invariants on load.
	StoreCorrupt(&'static str),
	/// An instance id or wrapped-key id that already exists in the store.
	DuplicateIdentifier(u64),
	/// The supplied token does not unwrap the stored keys, or the passphrase
	/// failed verification.
	MasterKeyMismatch,
	/// No instance with the given id.
	UnknownInstance(u64),
	UserExists,
	UserNotFound,
}

impl From<std::io::Error> for VaultError {
	fn from(error: std::io::Error) -> VaultError {
		VaultError::Io(error)
	}
}

impl From<serde_json::Error> for VaultError {
	fn from(error: serde_json::Error) -> VaultError {
		VaultError::Serialization(error)
	}
}

impl From<CryptoError> for VaultError {
	fn from(error: CryptoError) -> VaultError {
		match error {
			CryptoError::IOError(e) => VaultError::Io(e),
			_ => VaultError::Crypto(error),
		}
	}
}

impl std::error::Error for VaultError {}

impl std::fmt::Display for VaultError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			VaultError::Io(e) => write!(f, "IO error: {e}"),
			VaultError::Serialization(e) => write!(f, "Serialization error: {e}"),
			VaultError::Crypto(e) => write!(f, "Cryptography error: {e}"),
			VaultError::StoreCorrupt(what) => write!(f, "Store is corrupt: {what}"),
			VaultError::DuplicateIdentifier(id) => write!(f, "Duplicate identifier: {id}"),
			VaultError::MasterKeyMismatch => write!(f, "Master key mismatch"),
			VaultError::UnknownInstance(id) => write!(f, "Unknown instance: {id}"),
			VaultError::UserExists => write!(f, "User already exists"),
			VaultError::UserNotFound => write!(f, "User not found"),
		}
	}
}
