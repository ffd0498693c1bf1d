//! User identity: the public key/data records stored on disk and the
//! session token that feeds master-key derivation.

use citadelcrypto::{self as crypto, MasterKey};
use serde::{Deserialize, Serialize};
use std::fmt;


/// Public identity material, one per vault.  Immutable after registration:
/// the salts and timestamp are inputs to the UUID, and the UUID locates every
/// file the vault owns.
#[derive(Serialize, Deserialize, Eq, PartialEq, Debug, Clone)]
pub struct UserKey {
	pub uuid: String,
	pub salt_username: String,
	pub salt_password: String,
	pub registration_time: u64,
}

impl UserKey {
	pub fn generate(username: &str, registration_time: u64) -> UserKey {
		let salt_username = crypto::generate_salt();
		let salt_password = crypto::generate_salt();
		let uuid = crypto::generate_uuid(username, &salt_username, registration_time);

		UserKey {
			uuid,
			salt_username,
			salt_password,
			registration_time,
		}
	}

	/// Recomputes the UUID from its inputs and compares in constant time.
	pub fn verify_uuid(&self, username: &str) -> bool {
		crypto::verify_uuid(username, &self.salt_username, self.registration_time, &self.uuid)
	}

	/// The filename stem every on-disk artifact of this vault derives from.
	pub fn file_uuid(&self) -> String {
		crypto::file_uuid(&self.uuid)
	}
}


/// Public account record, one per vault.  `hashed_password` changes on
/// rotation; `is_first_login` flips once, after the first successful login.
#[derive(Serialize, Deserialize, Eq, PartialEq, Debug, Clone)]
pub struct UserData {
	pub username: String,
	pub hashed_password: String,
	pub password_info_filename: String,
	pub file_info_filename: String,
	pub is_first_login: bool,
}

impl UserData {
	pub fn new(username: &str, passphrase: &str, user_key: &UserKey) -> UserData {
		let file_uuid = user_key.file_uuid();

		UserData {
			username: username.to_owned(),
			hashed_password: crypto::password_hash(passphrase, &user_key.salt_password),
			password_info_filename: format!("{file_uuid}.password.json"),
			file_info_filename: format!("{file_uuid}.files.json"),
			is_first_login: true,
		}
	}

	pub fn verify_password(&self, passphrase: &str, user_key: &UserKey) -> bool {
		crypto::verify_password_hash(passphrase, &user_key.salt_password, &self.hashed_password)
	}
}


/// Session token: UUID || passphrase.  Exists only in memory while the vault
/// is unlocked; never serialized, never logged, wiped on drop.  Its sole
/// purpose is master-key derivation.
pub struct Token(Vec<u8>);

impl Token {
	pub fn new(uuid: &str, passphrase: &str) -> Token {
		Token([uuid.as_bytes(), passphrase.as_bytes()].concat())
	}

	pub fn master_key(&self) -> MasterKey {
		crypto::master_key_from_token(&self.0)
	}
}

impl fmt::Debug for Token {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "Token(****)")
	}
}

impl Drop for Token {
	fn drop(&mut self) {
		crypto::wipe(&mut self.0);
	}
}
