//! Cryptographic core of the citadel vault: the cipher-cascade engine plus
//! the deterministic derivations that turn a (username, passphrase) pair into
//! identifiers and keys.
//!
//! Everything here is pure computation over byte strings; file handling and
//! store semantics live in `libcitadel`.

#[macro_use]
mod newtype_macros;
mod cascade;
mod error;
mod rc6;

pub use cascade::{decrypt_cascade, encrypt_cascade, is_reverse_pair, CipherAlgorithm, BLOCK_SIZE};
pub use error::CryptoError;

use data_encoding::{BASE64, HEXLOWER};
use rand::{rngs::OsRng, RngCore, TryRngCore};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;


new_type!(secret MasterKey(32););
new_type!(secret InstanceKey(32););


pub const SALT_LENGTH: usize = 16;
/// Digest length of a vault UUID (rendered as 32 lowercase hex characters).
pub const UUID_LENGTH: usize = 16;

const FILE_UUID_LENGTH: usize = 64;
const KDF_ROUNDS: u32 = 10_000;


/// Best-effort wipe of sensitive memory.  Not a guarantee against a hostile
/// OS, but it keeps secrets from lingering in freed buffers.
pub fn wipe(buffer: &mut [u8]) {
	for b in buffer.iter_mut() {
		unsafe { std::ptr::write_volatile(b, 0) };
	}
	std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}

pub(crate) fn wipe_u32(buffer: &mut [u32]) {
	for b in buffer.iter_mut() {
		unsafe { std::ptr::write_volatile(b, 0) };
	}
	std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}


/// Generates a fresh random salt, Base64-encoded.  Salts are immutable once
/// stored; they feed the UUID and password-hash derivations.
pub fn generate_salt() -> String {
	let mut salt = [0u8; SALT_LENGTH];
	OsRng.unwrap_err().fill_bytes(&mut salt);
	BASE64.encode(&salt)
}

/// Generates a fresh random 256-bit per-instance key.
pub fn generate_instance_key() -> InstanceKey {
	InstanceKey::from_rng(&mut OsRng.unwrap_err())
}


/// Reduces `data` to exactly `size_limit` bytes: the first block is
/// SHA-512(data), each further block is SHA-512 of the previous block
/// concatenated with itself, and the final block is truncated.
pub fn hash_reduce(data: &[u8], size_limit: usize) -> Vec<u8> {
	let mut block = Sha512::digest(data);
	let mut out = Vec::with_capacity(size_limit);
	out.extend_from_slice(&block[..]);

	while out.len() < size_limit {
		block = Sha512::digest([&block[..], &block[..]].concat());
		out.extend_from_slice(&block[..]);
	}

	out.truncate(size_limit);
	out
}

fn iterated_sha512(parts: &[&[u8]], rounds: u32) -> [u8; 64] {
	let mut hasher = Sha512::new();
	for part in parts {
		hasher.update(part);
	}
	let mut digest = hasher.finalize();
	for _ in 1..rounds {
		digest = Sha512::digest(&digest[..]);
	}

	let mut out = [0u8; 64];
	out.copy_from_slice(&digest[..]);
	out
}


/// Derives the stable vault UUID from the username, its Base64 salt, and the
/// registration timestamp.  Pure: identical inputs always yield the same
/// 32-character lowercase-hex UUID.
pub fn generate_uuid(username: &str, salt: &str, registration_time: u64) -> String {
	let material = [username.as_bytes(), salt.as_bytes(), registration_time.to_string().as_bytes()].concat();
	HEXLOWER.encode(&hash_reduce(&material, UUID_LENGTH))
}

pub fn verify_uuid(username: &str, salt: &str, registration_time: u64, expected: &str) -> bool {
	constant_time_str_eq(&generate_uuid(username, salt, registration_time), expected)
}

/// Derives the on-disk filename stem from a UUID.  The domain tag keeps the
/// stem underivable from the UUID without knowing this scheme, and distinct
/// from the UUID itself.
pub fn file_uuid(uuid: &str) -> String {
	let material = [b"file".as_slice(), uuid.as_bytes()].concat();
	HEXLOWER.encode(&hash_reduce(&material, FILE_UUID_LENGTH))
}


/// Salted, iterated password hash, Base64-encoded.  Used only to verify the
/// login passphrase; the master key is derived separately from the token.
pub fn password_hash(passphrase: &str, salt: &str) -> String {
	BASE64.encode(&iterated_sha512(&[salt.as_bytes(), passphrase.as_bytes()], KDF_ROUNDS))
}

pub fn verify_password_hash(passphrase: &str, salt: &str, expected: &str) -> bool {
	constant_time_str_eq(&password_hash(passphrase, salt), expected)
}


/// Expands a session token (UUID || passphrase) into the 256-bit master key
/// that wraps every per-instance key.
pub fn master_key_from_token(token: &[u8]) -> MasterKey {
	let mut digest = iterated_sha512(&[token], KDF_ROUNDS);
	let key = MasterKey::from_slice(&digest[..32]).expect("internal error");
	wipe(&mut digest);
	key
}

/// Hash of an unwrapped per-instance key, stored beside the wrapped key so a
/// wrong master key is detected without revealing anything about the key.
pub fn key_fingerprint(key: &InstanceKey) -> String {
	let digest = Sha512::digest(&key[..]);
	HEXLOWER.encode(&digest[..])
}

/// Constant-time comparison for derived identifiers and digests.
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
	a.as_bytes().ct_eq(b.as_bytes()).into()
}
