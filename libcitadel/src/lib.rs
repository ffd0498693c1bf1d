// Methodology Note:
// This library enforces invariants by using Rust's visibility rules.
// A store owns its instance list and the wrapped-key maps as private fields,
// so the pairing between an instance and its wrapped key can only change
// through store methods that update both sides together.  Secrets follow the
// same idea: plaintext passwords are only ever returned by value from the
// find/list operations, the session token and every derived key live in
// wiped-on-drop containers, and the persisted records have no field that
// could hold a secret.
//
// All disk mutation goes through write-temp + fsync + rename, so a reader
// always sees either the previous or the new file, never a torn one.
//
// NOTE: Changing any of the structs which derive Serialize/Deserialize, or
// the derivations pinned in citadelcrypto, breaks every stored vault.

mod errors;
mod identity;
mod store;

pub use citadelcrypto;
pub use errors::VaultError;
pub use identity::{Token, UserData, UserKey};
pub use store::{FileInstance, FileStore, PasswordInstance, PasswordStore, UnlockedEntry, WrappedKey};

use citadelcrypto as crypto;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
	fs::{self, File},
	io::{self, BufReader, Write},
	path::{Path, PathBuf},
};
use tempfile::NamedTempFile;


/// A vault rooted at one directory: `users/` holds the public user records,
/// `data/` the encrypted stores and file payloads.
pub struct Vault {
	root: PathBuf,
}

impl Vault {
	/// Opens a vault directory, creating the layout if it does not exist.
	pub fn open<P: AsRef<Path>>(root: P) -> Result<Vault, VaultError> {
		let vault = Vault {
			root: root.as_ref().to_path_buf(),
		};
		fs::create_dir_all(vault.users_dir())?;
		fs::create_dir_all(vault.data_dir())?;
		Ok(vault)
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	fn users_dir(&self) -> PathBuf {
		self.root.join("users")
	}

	fn data_dir(&self) -> PathBuf {
		self.root.join("data")
	}

	fn user_record_path(&self, user_key: &UserKey) -> PathBuf {
		self.users_dir().join(format!("{}.json", user_key.file_uuid()))
	}

	/// Registers a new user: fresh salts, registration timestamp, UUID and
	/// password hash, persisted as a single user record.  The data stores
	/// are created on first login.
	pub fn register(&self, username: &str, passphrase: &str) -> Result<(UserKey, UserData), VaultError> {
		if self.find_user(username)?.is_some() {
			return Err(VaultError::UserExists);
		}

		let user_key = UserKey::generate(username, unix_timestamp());
		let user_data = UserData::new(username, passphrase, &user_key);
		self.save_user(&user_key, &user_data)?;

		info!("registered vault user {username}");
		Ok((user_key, user_data))
	}

	/// Verifies the passphrase and returns an unlocked session.  The first
	/// successful login creates the (empty, well-formed) data stores and
	/// clears `is_first_login`; re-running the initialization is safe.
	pub fn login(&self, username: &str, passphrase: &str) -> Result<Session, VaultError> {
		let (user_key, mut user_data) = self.find_user(username)?.ok_or(VaultError::UserNotFound)?;

		if !user_key.verify_uuid(username) {
			warn!("user record for {username} does not match its uuid");
			return Err(VaultError::StoreCorrupt("user record uuid mismatch"));
		}
		if !user_data.verify_password(passphrase, &user_key) {
			return Err(VaultError::MasterKeyMismatch);
		}

		self.initialize_stores(&user_key, &user_data)?;

		if user_data.is_first_login {
			user_data.is_first_login = false;
			self.save_user(&user_key, &user_data)?;
			debug!("completed first login for {username}");
		}

		Ok(Session {
			token: Token::new(&user_key.uuid, passphrase),
			user_key,
			user_data,
			data_dir: self.data_dir(),
		})
	}

	/// Rotates the master key: every per-instance key in both stores is
	/// unwrapped under the old token and re-wrapped under the new one, in
	/// memory, then all files are replaced atomically.  Any failure aborts
	/// with nothing written.  Salts never change, so the UUID and every
	/// derived filename stay stable; only the password hash is recomputed.
	pub fn change_passphrase(&self, username: &str, old_passphrase: &str, new_passphrase: &str) -> Result<(), VaultError> {
		let (user_key, mut user_data) = self.find_user(username)?.ok_or(VaultError::UserNotFound)?;

		if !user_key.verify_uuid(username) {
			return Err(VaultError::StoreCorrupt("user record uuid mismatch"));
		}
		if !user_data.verify_password(old_passphrase, &user_key) {
			return Err(VaultError::MasterKeyMismatch);
		}

		self.initialize_stores(&user_key, &user_data)?;

		let old_token = Token::new(&user_key.uuid, old_passphrase);
		let new_token = Token::new(&user_key.uuid, new_passphrase);
		let old_master_key = old_token.master_key();
		let new_master_key = new_token.master_key();

		let password_store_path = self.data_dir().join(&user_data.password_info_filename);
		let file_store_path = self.data_dir().join(&user_data.file_info_filename);

		let mut password_store = PasswordStore::load(&password_store_path)?;
		let mut file_store = FileStore::load(&file_store_path)?;

		password_store.rotate_master_key(&old_master_key, &new_master_key)?;
		file_store.rotate_master_key(&old_master_key, &new_master_key)?;

		user_data.hashed_password = crypto::password_hash(new_passphrase, &user_key.salt_password);

		password_store.save(&password_store_path)?;
		file_store.save(&file_store_path)?;
		self.save_user(&user_key, &user_data)?;

		info!(
			"rotated master key for {username}: {} password instances, {} file instances",
			password_store.len(),
			file_store.len()
		);
		Ok(())
	}

	/// Verified account deletion: removes the user record, both stores, and
	/// every encrypted payload.
	pub fn delete_user(&self, username: &str, passphrase: &str) -> Result<(), VaultError> {
		let (user_key, user_data) = self.find_user(username)?.ok_or(VaultError::UserNotFound)?;
		if !user_data.verify_password(passphrase, &user_key) {
			return Err(VaultError::MasterKeyMismatch);
		}

		let payload_dir = self.data_dir().join(format!("{}.files", user_key.file_uuid()));
		if payload_dir.is_dir() {
			fs::remove_dir_all(&payload_dir)?;
		}
		for filename in [&user_data.password_info_filename, &user_data.file_info_filename] {
			let path = self.data_dir().join(filename);
			if path.is_file() {
				fs::remove_file(&path)?;
			}
		}
		fs::remove_file(self.user_record_path(&user_key))?;

		info!("deleted vault user {username}");
		Ok(())
	}

	/// Writes the user record as JSON under its UUID-derived filename.
	pub fn save_user(&self, user_key: &UserKey, user_data: &UserData) -> Result<(), VaultError> {
		#[derive(Serialize)]
		struct UserRecordRef<'a> {
			#[serde(flatten)]
			user_key: &'a UserKey,
			#[serde(flatten)]
			user_data: &'a UserData,
		}

		let payload = serde_json::to_vec(&UserRecordRef { user_key, user_data })?;
		atomic_write(&self.user_record_path(user_key), &payload)
	}

	/// Loads the user record at its deterministic path.
	pub fn load_user(&self, user_key: &UserKey) -> Result<UserData, VaultError> {
		let record = read_user_record(&self.user_record_path(user_key))?;
		Ok(record.user_data)
	}

	/// Scans the flat `users/` directory for the record belonging to
	/// `username`.  Records that fail to parse are skipped with a warning so
	/// one damaged file cannot lock out every user.
	pub fn find_user(&self, username: &str) -> Result<Option<(UserKey, UserData)>, VaultError> {
		for entry in fs::read_dir(self.users_dir())? {
			let path = entry?.path();
			if path.extension().map_or(true, |e| e != "json") {
				continue;
			}

			match read_user_record(&path) {
				Ok(record) => {
					if record.user_data.username == username {
						return Ok(Some((record.user_key, record.user_data)));
					}
				}
				Err(e) => warn!("skipping unreadable user record {}: {e}", path.display()),
			}
		}
		Ok(None)
	}

	// Creates empty stores and the payload directory if they're missing.
	// Idempotent; existing files are never touched.
	fn initialize_stores(&self, user_key: &UserKey, user_data: &UserData) -> Result<(), VaultError> {
		let password_store_path = self.data_dir().join(&user_data.password_info_filename);
		if !password_store_path.exists() {
			PasswordStore::new().save(&password_store_path)?;
		}

		let file_store_path = self.data_dir().join(&user_data.file_info_filename);
		if !file_store_path.exists() {
			FileStore::new().save(&file_store_path)?;
		}

		fs::create_dir_all(self.data_dir().join(format!("{}.files", user_key.file_uuid())))?;
		Ok(())
	}
}


/// An unlocked vault session: the token plus the resolved store paths.  All
/// store operations for a logged-in user go through here.
pub struct Session {
	token: Token,
	user_key: UserKey,
	user_data: UserData,
	data_dir: PathBuf,
}

impl Session {
	pub fn token(&self) -> &Token {
		&self.token
	}

	pub fn user_key(&self) -> &UserKey {
		&self.user_key
	}

	pub fn user_data(&self) -> &UserData {
		&self.user_data
	}

	pub fn password_store_path(&self) -> PathBuf {
		self.data_dir.join(&self.user_data.password_info_filename)
	}

	pub fn file_store_path(&self) -> PathBuf {
		self.data_dir.join(&self.user_data.file_info_filename)
	}

	/// Directory holding the encrypted payloads of the file store.
	pub fn payload_dir(&self) -> PathBuf {
		self.data_dir.join(format!("{}.files", self.user_key.file_uuid()))
	}

	/// Path of one encrypted payload, named after its instance id.
	pub fn payload_path(&self, instance_id: u64) -> PathBuf {
		self.payload_dir().join(format!("{instance_id}.bin"))
	}

	pub fn load_password_store(&self) -> Result<PasswordStore, VaultError> {
		PasswordStore::load(&self.password_store_path())
	}

	pub fn save_password_store(&self, store: &PasswordStore) -> Result<(), VaultError> {
		store.save(&self.password_store_path())
	}

	pub fn load_file_store(&self) -> Result<FileStore, VaultError> {
		FileStore::load(&self.file_store_path())
	}

	pub fn save_file_store(&self, store: &FileStore) -> Result<(), VaultError> {
		store.save(&self.file_store_path())
	}

	/// Encrypts `source` under a file instance into the vault's payload
	/// directory.
	pub fn encrypt_file(&self, store: &FileStore, instance_id: u64, source: &Path) -> Result<(), VaultError> {
		store.encrypt_file(&self.token, instance_id, source, &self.payload_path(instance_id))
	}

	/// Decrypts a stored payload back out to `destination`.
	pub fn decrypt_file(&self, store: &FileStore, instance_id: u64, destination: &Path) -> Result<(), VaultError> {
		store.decrypt_file(&self.token, instance_id, &self.payload_path(instance_id), destination)
	}

	/// Removes a file instance together with its encrypted payload.
	pub fn remove_file_instance(&self, store: &mut FileStore, instance_id: u64) -> Result<bool, VaultError> {
		if !store.remove(instance_id) {
			return Ok(false);
		}
		let payload = self.payload_path(instance_id);
		if payload.is_file() {
			fs::remove_file(&payload)?;
		}
		Ok(true)
	}
}


#[derive(Deserialize)]
struct UserRecord {
	#[serde(flatten)]
	user_key: UserKey,
	#[serde(flatten)]
	user_data: UserData,
}

fn read_user_record(path: &Path) -> Result<UserRecord, VaultError> {
	let file = File::open(path)?;
	Ok(serde_json::from_reader(BufReader::new(file))?)
}


// Write the payload to a temporary sibling, fsync, then rename over the
// destination.  Moving a temporary file is atomic (at least on *nix), so a
// crash at any point leaves the previous file intact.
pub(crate) fn atomic_write(path: &Path, payload: &[u8]) -> Result<(), VaultError> {
	let parent = path.parent().ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Bad path"))?;
	let mut temp_file = NamedTempFile::new_in(parent)?;

	temp_file.write_all(payload)?;
	temp_file.as_file().sync_all()?;
	temp_file.into_temp_path().persist(path).map_err(|e| VaultError::Io(e.error))?;
	Ok(())
}


// Returns the current unix timestamp in seconds.
// The vault won't handle time before the unix epoch, so we return u64.
fn unix_timestamp() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.expect("system clock before unix epoch")
		.as_secs()
}


#[cfg(test)]
mod tests {
	use super::{atomic_write, Vault, VaultError};
	use tempfile::tempdir;

	#[test]
	fn test_atomic_write_replaces_content() {
		let tmp_dir = tempdir().unwrap();
		let path = tmp_dir.path().join("file.json");

		atomic_write(&path, b"first").unwrap();
		assert_eq!(std::fs::read(&path).unwrap(), b"first");

		atomic_write(&path, b"second").unwrap();
		assert_eq!(std::fs::read(&path).unwrap(), b"second");

		// No temporary files left behind.
		assert_eq!(std::fs::read_dir(tmp_dir.path()).unwrap().count(), 1);
	}

	#[test]
	fn test_register_rejects_duplicate_username() {
		let tmp_dir = tempdir().unwrap();
		let vault = Vault::open(tmp_dir.path()).unwrap();

		vault.register("alice", "pw0").unwrap();
		assert!(matches!(vault.register("alice", "other"), Err(VaultError::UserExists)));
	}

	#[test]
	fn test_login_unknown_user() {
		let tmp_dir = tempdir().unwrap();
		let vault = Vault::open(tmp_dir.path()).unwrap();

		assert!(matches!(vault.login("nobody", "pw"), Err(VaultError::UserNotFound)));
	}

	#[test]
	fn test_save_load_user_record() {
		let tmp_dir = tempdir().unwrap();
		let vault = Vault::open(tmp_dir.path()).unwrap();

		let (user_key, user_data) = vault.register("alice", "pw0").unwrap();
		let loaded = vault.load_user(&user_key).unwrap();

		assert_eq!(loaded, user_data);
	}
}
