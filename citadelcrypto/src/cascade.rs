//! Cascade encryption: a byte string run through an ordered list of block
//! ciphers under a single cascade key.
//!
//! On-disk format, version 1 (changing any of this breaks every stored
//! vault, so it is pinned here):
//!   - Every cipher runs in CBC mode over 16-byte blocks, driven through
//!     `cbc::Encryptor`/`cbc::Decryptor`.
//!   - PKCS#7 padding is applied once before the first encryption layer and
//!     removed once after the last decryption layer; the layers themselves
//!     run unpadded.
//!   - Per-layer key: HMAC-SHA-512(K, "key" || name), truncated to the
//!     cipher's native key size.
//!   - Per-layer IV: HMAC-SHA-512(K, "iv" || name || context), truncated to
//!     one block.  `context` domain-separates independent messages encrypted
//!     under the same key (file chunks pass their chunk index; single-message
//!     callers pass nothing).

use crate::{error::CryptoError, rc6::Rc6};
use aes::Aes256;
use cbc::cipher::{block_padding::NoPadding, BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit, KeySizeUser};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serpent::Serpent;
use sha2::Sha512;
use sm4::Sm4;
use std::fmt;
use twofish::Twofish;


pub const BLOCK_SIZE: usize = 16;

const LAYER_KEY_TAG: &[u8] = b"key";
const LAYER_IV_TAG: &[u8] = b"iv";


/// The supported cipher set.  Serialized by its exact, case-sensitive name.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum CipherAlgorithm {
	Aes,
	Rc6,
	Sm4,
	Twofish,
	Serpent,
}

impl CipherAlgorithm {
	pub const ALL: [CipherAlgorithm; 5] = [
		CipherAlgorithm::Aes,
		CipherAlgorithm::Rc6,
		CipherAlgorithm::Sm4,
		CipherAlgorithm::Twofish,
		CipherAlgorithm::Serpent,
	];

	pub fn name(&self) -> &'static str {
		match self {
			CipherAlgorithm::Aes => "AES",
			CipherAlgorithm::Rc6 => "RC6",
			CipherAlgorithm::Sm4 => "SM4",
			CipherAlgorithm::Twofish => "Twofish",
			CipherAlgorithm::Serpent => "Serpent",
		}
	}

	pub fn from_name(name: &str) -> Result<CipherAlgorithm, CryptoError> {
		match name {
			"AES" => Ok(CipherAlgorithm::Aes),
			"RC6" => Ok(CipherAlgorithm::Rc6),
			"SM4" => Ok(CipherAlgorithm::Sm4),
			"Twofish" => Ok(CipherAlgorithm::Twofish),
			"Serpent" => Ok(CipherAlgorithm::Serpent),
			_ => Err(CryptoError::InvalidAlgorithm),
		}
	}

	fn key_size(&self) -> usize {
		match self {
			CipherAlgorithm::Aes => Aes256::key_size(),
			CipherAlgorithm::Rc6 => Rc6::key_size(),
			CipherAlgorithm::Sm4 => Sm4::key_size(),
			CipherAlgorithm::Twofish => Twofish::key_size(),
			CipherAlgorithm::Serpent => Serpent::key_size(),
		}
	}
}

impl fmt::Display for CipherAlgorithm {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl Serialize for CipherAlgorithm {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str(self.name())
	}
}

impl<'de> Deserialize<'de> for CipherAlgorithm {
	fn deserialize<D>(deserializer: D) -> Result<CipherAlgorithm, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		struct NameVisitor;
		impl<'de> serde::de::Visitor<'de> for NameVisitor {
			type Value = CipherAlgorithm;

			fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
				write!(formatter, "a cipher algorithm name")
			}

			fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
			where
				E: serde::de::Error,
			{
				CipherAlgorithm::from_name(v).map_err(|_| E::custom(format!("unknown cipher algorithm: {v}")))
			}
		}
		deserializer.deserialize_str(NameVisitor)
	}
}


/// True when `decryption` undoes `encryption`: same length, reverse order,
/// and at least one cipher.
pub fn is_reverse_pair(encryption: &[CipherAlgorithm], decryption: &[CipherAlgorithm]) -> bool {
	!encryption.is_empty() && encryption.len() == decryption.len() && encryption.iter().rev().zip(decryption.iter()).all(|(a, b)| a == b)
}


/// Encrypts `plaintext` under `key`, applying `algorithms` left to right.
pub fn encrypt_cascade(plaintext: &[u8], key: &[u8], algorithms: &[CipherAlgorithm], context: &[u8]) -> Result<Vec<u8>, CryptoError> {
	if algorithms.is_empty() {
		return Err(CryptoError::InvalidAlgorithm);
	}

	let mut buffer = plaintext.to_vec();
	pad(&mut buffer);

	for algorithm in algorithms {
		let mut key_material = derive_layer_key(key, *algorithm);
		let iv = derive_layer_iv(key, *algorithm, context);
		encrypt_layer(*algorithm, &key_material, &iv, &mut buffer);
		crate::wipe(&mut key_material);
	}

	Ok(buffer)
}

/// Decrypts `ciphertext` under `key`.  `algorithms` is the decryption order,
/// i.e. the reverse of the list that produced the ciphertext.
pub fn decrypt_cascade(ciphertext: &[u8], key: &[u8], algorithms: &[CipherAlgorithm], context: &[u8]) -> Result<Vec<u8>, CryptoError> {
	if algorithms.is_empty() {
		return Err(CryptoError::InvalidAlgorithm);
	}
	if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
		return Err(CryptoError::CipherIntegrity);
	}

	let mut buffer = ciphertext.to_vec();

	for algorithm in algorithms {
		let mut key_material = derive_layer_key(key, *algorithm);
		let iv = derive_layer_iv(key, *algorithm, context);
		decrypt_layer(*algorithm, &key_material, &iv, &mut buffer);
		crate::wipe(&mut key_material);
	}

	unpad(&mut buffer)?;
	Ok(buffer)
}


fn encrypt_layer(algorithm: CipherAlgorithm, key_material: &[u8], iv: &[u8; BLOCK_SIZE], buffer: &mut [u8]) {
	match algorithm {
		CipherAlgorithm::Aes => cbc_encrypt::<Aes256>(key_material, iv, buffer),
		CipherAlgorithm::Rc6 => cbc_encrypt::<Rc6>(key_material, iv, buffer),
		CipherAlgorithm::Sm4 => cbc_encrypt::<Sm4>(key_material, iv, buffer),
		CipherAlgorithm::Twofish => cbc_encrypt::<Twofish>(key_material, iv, buffer),
		CipherAlgorithm::Serpent => cbc_encrypt::<Serpent>(key_material, iv, buffer),
	}
}

fn decrypt_layer(algorithm: CipherAlgorithm, key_material: &[u8], iv: &[u8; BLOCK_SIZE], buffer: &mut [u8]) {
	match algorithm {
		CipherAlgorithm::Aes => cbc_decrypt::<Aes256>(key_material, iv, buffer),
		CipherAlgorithm::Rc6 => cbc_decrypt::<Rc6>(key_material, iv, buffer),
		CipherAlgorithm::Sm4 => cbc_decrypt::<Sm4>(key_material, iv, buffer),
		CipherAlgorithm::Twofish => cbc_decrypt::<Twofish>(key_material, iv, buffer),
		CipherAlgorithm::Serpent => cbc_decrypt::<Serpent>(key_material, iv, buffer),
	}
}

// The buffer is always a whole number of blocks here (the cascade pads once
// up front), so the layers run the `cbc` crate with `NoPadding`.  The key
// material is derived at the cipher's exact native size and the IV at the
// block size, so construction cannot fail.
fn cbc_encrypt<C>(key_material: &[u8], iv: &[u8; BLOCK_SIZE], buffer: &mut [u8])
where
	C: BlockCipher + BlockEncryptMut + KeyInit,
{
	let length = buffer.len();
	cbc::Encryptor::<C>::new_from_slices(key_material, iv)
		.expect("internal error")
		.encrypt_padded_mut::<NoPadding>(buffer, length)
		.expect("internal error");
}

fn cbc_decrypt<C>(key_material: &[u8], iv: &[u8; BLOCK_SIZE], buffer: &mut [u8])
where
	C: BlockCipher + BlockDecryptMut + KeyInit,
{
	cbc::Decryptor::<C>::new_from_slices(key_material, iv)
		.expect("internal error")
		.decrypt_padded_mut::<NoPadding>(buffer)
		.expect("internal error");
}


fn derive_layer_key(key: &[u8], algorithm: CipherAlgorithm) -> Vec<u8> {
	let okm = hmac_512(key, &[LAYER_KEY_TAG, algorithm.name().as_bytes()]);
	okm[..algorithm.key_size()].to_vec()
}

fn derive_layer_iv(key: &[u8], algorithm: CipherAlgorithm, context: &[u8]) -> [u8; BLOCK_SIZE] {
	let okm = hmac_512(key, &[LAYER_IV_TAG, algorithm.name().as_bytes(), context]);
	let mut iv = [0u8; BLOCK_SIZE];
	iv.copy_from_slice(&okm[..BLOCK_SIZE]);
	iv
}

fn hmac_512(key: &[u8], parts: &[&[u8]]) -> [u8; 64] {
	let mut hmac = <Hmac<Sha512> as Mac>::new_from_slice(key).expect("unexpected");
	for part in parts {
		hmac.update(part);
	}
	let mut okm = [0u8; 64];
	okm.copy_from_slice(&hmac.finalize().into_bytes()[..]);
	okm
}


fn pad(buffer: &mut Vec<u8>) {
	let pad_len = BLOCK_SIZE - buffer.len() % BLOCK_SIZE;
	buffer.resize(buffer.len() + pad_len, pad_len as u8);
}

fn unpad(buffer: &mut Vec<u8>) -> Result<(), CryptoError> {
	let pad_len = *buffer.last().ok_or(CryptoError::CipherIntegrity)? as usize;
	if pad_len == 0 || pad_len > BLOCK_SIZE || pad_len > buffer.len() {
		return Err(CryptoError::CipherIntegrity);
	}
	if !buffer[buffer.len() - pad_len..].iter().all(|&b| b as usize == pad_len) {
		return Err(CryptoError::CipherIntegrity);
	}
	buffer.truncate(buffer.len() - pad_len);
	Ok(())
}
