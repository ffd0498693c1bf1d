use super::{validate_cascade_pair, validate_unique_ids, KeyMaps, WrappedKey};
use crate::errors::VaultError;
use citadelcrypto::{self as crypto, decrypt_cascade, encrypt_cascade, CipherAlgorithm, MasterKey};
use data_encoding::BASE64;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;


/// One stored secret.  The plaintext is never held here: retrieval returns
/// an [`UnlockedEntry`] by value and the record keeps only ciphertext.
#[derive(Serialize, Deserialize, Eq, PartialEq, Debug, Clone)]
pub struct PasswordInstance {
	id: u64,
	description: String,
	encrypted_password: String,
	encryption_algorithms: Vec<CipherAlgorithm>,
	decryption_algorithms: Vec<CipherAlgorithm>,
	hashmap_id: u64,
}

impl PasswordInstance {
	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn description(&self) -> &str {
		&self.description
	}

	pub fn hashmap_id(&self) -> u64 {
		self.hashmap_id
	}

	pub fn encryption_algorithms(&self) -> &[CipherAlgorithm] {
		&self.encryption_algorithms
	}

	pub fn decryption_algorithms(&self) -> &[CipherAlgorithm] {
		&self.decryption_algorithms
	}
}


/// A decrypted view of one instance, returned by value so the store itself
/// never holds plaintext.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct UnlockedEntry {
	pub id: u64,
	pub description: String,
	pub password: String,
}


#[derive(Serialize, Deserialize, Eq, PartialEq, Debug, Clone, Default)]
pub struct PasswordStore {
	instances: Vec<PasswordInstance>,
	#[serde(flatten)]
	key_maps: KeyMaps,
}

impl PasswordStore {
	pub fn new() -> PasswordStore {
		Default::default()
	}

	pub fn len(&self) -> usize {
		self.instances.len()
	}

	pub fn is_empty(&self) -> bool {
		self.instances.is_empty()
	}

	pub fn instances(&self) -> &[PasswordInstance] {
		&self.instances
	}

	fn next_instance_id(&self) -> u64 {
		self.instances.iter().map(|i| i.id).max().map_or(1, |max| max + 1)
	}

	/// Creates a new instance: generates a fresh per-instance key, wraps it
	/// under the token's master key, and stores the password encrypted under
	/// the instance key.  Returns the new instance id.
	pub fn create(
		&mut self,
		token: &crate::Token,
		description: &str,
		password: &str,
		encryption_algorithms: Vec<CipherAlgorithm>,
		decryption_algorithms: Vec<CipherAlgorithm>,
	) -> Result<u64, VaultError> {
		validate_cascade_pair(&encryption_algorithms, &decryption_algorithms)?;

		let id = self.next_instance_id();
		let hashmap_id = self.key_maps.next_id();
		let master_key = token.master_key();
		let key = crypto::generate_instance_key();

		self.key_maps.wrap_new_key(hashmap_id, &key, &master_key, &encryption_algorithms)?;

		let ciphertext = encrypt_cascade(password.as_bytes(), &key[..], &encryption_algorithms, b"")?;
		self.instances.push(PasswordInstance {
			id,
			description: description.to_owned(),
			encrypted_password: BASE64.encode(&ciphertext),
			encryption_algorithms,
			decryption_algorithms,
			hashmap_id,
		});

		Ok(id)
	}

	/// Appends a pre-built instance together with its wrapped key and
	/// fingerprint.  Ids must be unused and the algorithm lists must undo
	/// each other.
	pub fn append(&mut self, instance: PasswordInstance, wrapped_key: WrappedKey, key_hash: String) -> Result<(), VaultError> {
		validate_cascade_pair(&instance.encryption_algorithms, &instance.decryption_algorithms)?;
		if self.instances.iter().any(|i| i.id == instance.id) {
			return Err(VaultError::DuplicateIdentifier(instance.id));
		}
		self.key_maps.insert(instance.hashmap_id, wrapped_key, key_hash)?;
		self.instances.push(instance);
		Ok(())
	}

	/// Edits an instance.  A pure metadata edit (same algorithms, no new
	/// password) touches no cryptography.  Changing the algorithm lists
	/// re-wraps the instance key (fingerprint unchanged) and re-encrypts the
	/// plaintext under the new cascade.
	pub fn change(
		&mut self,
		id: u64,
		new_description: &str,
		new_password: Option<&str>,
		new_encryption_algorithms: Vec<CipherAlgorithm>,
		new_decryption_algorithms: Vec<CipherAlgorithm>,
		token: &crate::Token,
	) -> Result<(), VaultError> {
		validate_cascade_pair(&new_encryption_algorithms, &new_decryption_algorithms)?;

		let index = self.instances.iter().position(|i| i.id == id).ok_or(VaultError::UnknownInstance(id))?;
		let algorithms_changed = new_encryption_algorithms != self.instances[index].encryption_algorithms;

		if !algorithms_changed && new_password.is_none() {
			self.instances[index].description = new_description.to_owned();
			return Ok(());
		}

		let master_key = token.master_key();
		let key = {
			let instance = &self.instances[index];
			self.key_maps.unwrap_key(instance.hashmap_id, &master_key, &instance.decryption_algorithms)?
		};

		let mut plaintext = match new_password {
			Some(password) => password.as_bytes().to_vec(),
			None => {
				let instance = &self.instances[index];
				let ciphertext = BASE64
					.decode(instance.encrypted_password.as_bytes())
					.map_err(|_| VaultError::StoreCorrupt("encrypted password is not valid Base64"))?;
				decrypt_cascade(&ciphertext, &key[..], &instance.decryption_algorithms, b"")?
			}
		};

		if algorithms_changed {
			let rewrapped = WrappedKey(encrypt_cascade(&key[..], &master_key[..], &new_encryption_algorithms, b"")?);
			self.key_maps.replace_one(self.instances[index].hashmap_id, rewrapped)?;
		}

		let ciphertext = encrypt_cascade(&plaintext, &key[..], &new_encryption_algorithms, b"")?;
		crypto::wipe(&mut plaintext);

		let instance = &mut self.instances[index];
		instance.description = new_description.to_owned();
		instance.encrypted_password = BASE64.encode(&ciphertext);
		instance.encryption_algorithms = new_encryption_algorithms;
		instance.decryption_algorithms = new_decryption_algorithms;

		Ok(())
	}

	pub fn find_by_id(&self, token: &crate::Token, id: u64) -> Result<Option<UnlockedEntry>, VaultError> {
		match self.instances.iter().find(|i| i.id == id) {
			Some(instance) => Ok(Some(self.decrypt_instance(&token.master_key(), instance)?)),
			None => Ok(None),
		}
	}

	/// Finds the first instance with exactly this description.
	pub fn find_by_description(&self, token: &crate::Token, description: &str) -> Result<Option<UnlockedEntry>, VaultError> {
		match self.instances.iter().find(|i| i.description == description) {
			Some(instance) => Ok(Some(self.decrypt_instance(&token.master_key(), instance)?)),
			None => Ok(None),
		}
	}

	/// Description lookup by id; needs no token because descriptions are
	/// plaintext labels.
	pub fn description_of(&self, id: u64) -> Option<&str> {
		self.instances.iter().find(|i| i.id == id).map(|i| i.description.as_str())
	}

	/// Decrypts every instance.  The master key is derived once.
	pub fn list_all(&self, token: &crate::Token) -> Result<Vec<UnlockedEntry>, VaultError> {
		let master_key = token.master_key();
		self.instances.iter().map(|instance| self.decrypt_instance(&master_key, instance)).collect()
	}

	fn decrypt_instance(&self, master_key: &MasterKey, instance: &PasswordInstance) -> Result<UnlockedEntry, VaultError> {
		let key = self.key_maps.unwrap_key(instance.hashmap_id, master_key, &instance.decryption_algorithms)?;

		let ciphertext = BASE64
			.decode(instance.encrypted_password.as_bytes())
			.map_err(|_| VaultError::StoreCorrupt("encrypted password is not valid Base64"))?;
		let plaintext = decrypt_cascade(&ciphertext, &key[..], &instance.decryption_algorithms, b"")?;

		let password = String::from_utf8(plaintext).map_err(|_| VaultError::StoreCorrupt("decrypted password is not valid UTF-8"))?;

		Ok(UnlockedEntry {
			id: instance.id,
			description: instance.description.clone(),
			password,
		})
	}

	/// Removes an instance and its wrapped-key entries.  Returns false if the
	/// id is unknown.
	pub fn remove(&mut self, id: u64) -> bool {
		match self.instances.iter().position(|i| i.id == id) {
			Some(index) => {
				let instance = self.instances.remove(index);
				self.key_maps.remove(instance.hashmap_id);
				true
			}
			None => false,
		}
	}

	pub fn remove_all(&mut self) {
		self.instances.clear();
		self.key_maps.clear();
	}

	/// Re-wraps every instance key under a new master key, entirely in
	/// memory.  Fails without modifying anything if a single key does not
	/// unwrap and verify under the old master key.
	pub fn rotate_master_key(&mut self, old_master_key: &MasterKey, new_master_key: &MasterKey) -> Result<(), VaultError> {
		let mut rewrapped = std::collections::HashMap::new();
		for instance in &self.instances {
			let wrapped = self.key_maps.rewrapped(
				instance.hashmap_id,
				old_master_key,
				new_master_key,
				&instance.encryption_algorithms,
				&instance.decryption_algorithms,
			)?;
			rewrapped.insert(instance.hashmap_id, wrapped);
		}

		self.key_maps.replace_wrapped(rewrapped);
		Ok(())
	}

	pub fn save(&self, path: &Path) -> Result<(), VaultError> {
		let payload = serde_json::to_vec(&self)?;
		crate::atomic_write(path, &payload)
	}

	pub fn load(path: &Path) -> Result<PasswordStore, VaultError> {
		let data = std::fs::read(path)?;
		let store: PasswordStore = serde_json::from_slice(&data).map_err(|e| {
			warn!("password store at {} failed to parse: {e}", path.display());
			VaultError::StoreCorrupt("malformed password store")
		})?;
		store.validate()?;
		Ok(store)
	}

	fn validate(&self) -> Result<(), VaultError> {
		validate_unique_ids(self.instances.iter().map(|i| i.id))?;
		validate_unique_ids(self.instances.iter().map(|i| i.hashmap_id))?;

		for instance in &self.instances {
			validate_cascade_pair(&instance.encryption_algorithms, &instance.decryption_algorithms)?;
			BASE64
				.decode(instance.encrypted_password.as_bytes())
				.map_err(|_| VaultError::StoreCorrupt("encrypted password is not valid Base64"))?;
		}

		let hashmap_ids: Vec<u64> = self.instances.iter().map(|i| i.hashmap_id).collect();
		self.key_maps.validate(&hashmap_ids)
	}
}


#[cfg(test)]
mod tests {
	use super::PasswordStore;
	use crate::{errors::VaultError, Token};
	use citadelcrypto::CipherAlgorithm::{self, Aes, Rc6, Serpent, Sm4, Twofish};
	use tempfile::tempdir;

	fn token() -> Token {
		Token::new("0123456789abcdef0123456789abcdef", "pw0")
	}

	fn enc_dec(encryption: &[CipherAlgorithm]) -> (Vec<CipherAlgorithm>, Vec<CipherAlgorithm>) {
		(encryption.to_vec(), encryption.iter().rev().copied().collect())
	}

	#[test]
	fn test_create_and_find() {
		let token = token();
		let mut store = PasswordStore::new();
		let (encryption, decryption) = enc_dec(&[Aes, Serpent]);

		let id = store.create(&token, "gmail", "S3cr!", encryption, decryption).unwrap();

		let entry = store.find_by_id(&token, id).unwrap().unwrap();
		assert_eq!(entry.password, "S3cr!");
		assert_eq!(entry.description, "gmail");

		let entry = store.find_by_description(&token, "gmail").unwrap().unwrap();
		assert_eq!(entry.id, id);
		assert_eq!(entry.password, "S3cr!");

		assert!(store.find_by_id(&token, id + 1).unwrap().is_none());
		assert!(store.find_by_description(&token, "hotmail").unwrap().is_none());
		assert_eq!(store.description_of(id), Some("gmail"));
	}

	#[test]
	fn test_ids_are_never_reused() {
		let token = token();
		let mut store = PasswordStore::new();
		let (encryption, decryption) = enc_dec(&[Aes]);

		let first = store.create(&token, "a", "1", encryption.clone(), decryption.clone()).unwrap();
		let second = store.create(&token, "b", "2", encryption.clone(), decryption.clone()).unwrap();
		assert_eq!(second, first + 1);

		assert!(store.remove(first));
		let third = store.create(&token, "c", "3", encryption, decryption).unwrap();
		assert_eq!(third, second + 1);
	}

	#[test]
	fn test_mismatched_algorithm_lists_rejected() {
		let token = token();
		let mut store = PasswordStore::new();

		let result = store.create(&token, "x", "y", vec![Aes, Serpent], vec![Aes, Serpent]);
		assert!(matches!(result, Err(VaultError::Crypto(_))));

		let result = store.create(&token, "x", "y", vec![], vec![]);
		assert!(matches!(result, Err(VaultError::Crypto(_))));
	}

	#[test]
	fn test_wrong_token_is_detected() {
		let token = token();
		let wrong = Token::new("0123456789abcdef0123456789abcdef", "pw1");
		let mut store = PasswordStore::new();
		let (encryption, decryption) = enc_dec(&[Twofish, Sm4]);

		let id = store.create(&token, "gmail", "S3cr!", encryption, decryption).unwrap();

		assert!(matches!(store.find_by_id(&wrong, id), Err(VaultError::MasterKeyMismatch)));
		assert!(matches!(store.list_all(&wrong), Err(VaultError::MasterKeyMismatch)));
	}

	#[test]
	fn test_list_all() {
		let token = token();
		let mut store = PasswordStore::new();

		for (description, password) in [("a", "1"), ("b", "2"), ("c", "3")] {
			let (encryption, decryption) = enc_dec(&[Rc6]);
			store.create(&token, description, password, encryption, decryption).unwrap();
		}

		let entries = store.list_all(&token).unwrap();
		assert_eq!(entries.len(), 3);
		assert_eq!(entries.iter().map(|e| e.password.as_str()).collect::<Vec<_>>(), vec!["1", "2", "3"]);
	}

	#[test]
	fn test_change_description_only() {
		let token = token();
		let mut store = PasswordStore::new();
		let (encryption, decryption) = enc_dec(&[Aes]);

		let id = store.create(&token, "old", "pw", encryption.clone(), decryption.clone()).unwrap();
		let encrypted_before = store.instances()[0].clone();

		store.change(id, "new", None, encryption, decryption, &token).unwrap();

		assert_eq!(store.description_of(id), Some("new"));
		// Metadata edits must not touch the ciphertext.
		assert_eq!(store.instances()[0].encrypted_password, encrypted_before.encrypted_password);
		assert_eq!(store.find_by_id(&token, id).unwrap().unwrap().password, "pw");
	}

	#[test]
	fn test_change_password() {
		let token = token();
		let mut store = PasswordStore::new();
		let (encryption, decryption) = enc_dec(&[Aes, Twofish]);

		let id = store.create(&token, "site", "old pw", encryption.clone(), decryption.clone()).unwrap();
		store.change(id, "site", Some("new pw"), encryption, decryption, &token).unwrap();

		assert_eq!(store.find_by_id(&token, id).unwrap().unwrap().password, "new pw");
	}

	#[test]
	fn test_change_algorithms_rewraps_key() {
		let token = token();
		let mut store = PasswordStore::new();
		let (encryption, decryption) = enc_dec(&[Aes]);

		let id = store.create(&token, "site", "pw", encryption, decryption).unwrap();
		let hashmap_id = store.instances()[0].hashmap_id();
		let fingerprint_before = store.key_maps.fingerprint(hashmap_id).unwrap().to_owned();
		let wrapped_before = store.key_maps.wrapped(hashmap_id).unwrap().clone();

		let (encryption, decryption) = enc_dec(&[Serpent, Rc6, Sm4]);
		store.change(id, "site", None, encryption, decryption, &token).unwrap();

		// Same key (same fingerprint), new wrapping, still decrypts.
		assert_eq!(store.key_maps.fingerprint(hashmap_id).unwrap(), fingerprint_before);
		assert_ne!(store.key_maps.wrapped(hashmap_id).unwrap(), &wrapped_before);
		assert_eq!(store.find_by_id(&token, id).unwrap().unwrap().password, "pw");
	}

	#[test]
	fn test_change_unknown_id() {
		let token = token();
		let mut store = PasswordStore::new();
		let (encryption, decryption) = enc_dec(&[Aes]);

		assert!(matches!(
			store.change(9, "x", None, encryption, decryption, &token),
			Err(VaultError::UnknownInstance(9))
		));
	}

	#[test]
	fn test_append_duplicate_rejected() {
		let token = token();
		let mut store = PasswordStore::new();
		let (encryption, decryption) = enc_dec(&[Aes]);

		let id = store.create(&token, "a", "1", encryption, decryption).unwrap();
		let instance = store.instances()[0].clone();
		let wrapped = store.key_maps.wrapped(instance.hashmap_id()).unwrap().clone();
		let fingerprint = store.key_maps.fingerprint(instance.hashmap_id()).unwrap().to_owned();

		assert!(matches!(store.append(instance, wrapped, fingerprint), Err(VaultError::DuplicateIdentifier(i)) if i == id));
	}

	#[test]
	fn test_remove() {
		let token = token();
		let mut store = PasswordStore::new();
		let (encryption, decryption) = enc_dec(&[Aes]);

		let id = store.create(&token, "a", "1", encryption, decryption).unwrap();
		assert_eq!(store.key_maps.len(), 1);

		assert!(store.remove(id));
		assert!(!store.remove(id));
		assert!(store.is_empty());
		assert_eq!(store.key_maps.len(), 0);
	}

	#[test]
	fn test_remove_all() {
		let token = token();
		let mut store = PasswordStore::new();

		for i in 0..4 {
			let (encryption, decryption) = enc_dec(&[Aes]);
			store.create(&token, &format!("site {i}"), "pw", encryption, decryption).unwrap();
		}

		store.remove_all();
		assert!(store.is_empty());
		assert_eq!(store.key_maps.len(), 0);
	}

	#[test]
	fn test_rotation_preserves_plaintexts() {
		let token = token();
		let new_token = Token::new("0123456789abcdef0123456789abcdef", "pw0new");
		let mut store = PasswordStore::new();

		let (encryption, decryption) = enc_dec(&[Aes, Serpent]);
		store.create(&token, "a", "1", encryption, decryption).unwrap();
		let (encryption, decryption) = enc_dec(&[Twofish, Rc6, Sm4]);
		store.create(&token, "b", "2", encryption, decryption).unwrap();

		store.rotate_master_key(&token.master_key(), &new_token.master_key()).unwrap();

		let entries = store.list_all(&new_token).unwrap();
		assert_eq!(entries.iter().map(|e| e.password.as_str()).collect::<Vec<_>>(), vec!["1", "2"]);
		assert!(matches!(store.list_all(&token), Err(VaultError::MasterKeyMismatch)));
	}

	#[test]
	fn test_rotation_failure_leaves_store_untouched() {
		let token = token();
		let wrong = Token::new("0123456789abcdef0123456789abcdef", "not the old passphrase");
		let new_token = Token::new("0123456789abcdef0123456789abcdef", "pw0new");
		let mut store = PasswordStore::new();

		let (encryption, decryption) = enc_dec(&[Aes]);
		store.create(&token, "a", "1", encryption, decryption).unwrap();
		let before = store.clone();

		assert!(matches!(
			store.rotate_master_key(&wrong.master_key(), &new_token.master_key()),
			Err(VaultError::MasterKeyMismatch)
		));
		assert_eq!(store, before);
	}

	#[test]
	fn test_save_load_round_trip() {
		let tmp_dir = tempdir().unwrap();
		let path = tmp_dir.path().join("store.password.json");
		let token = token();
		let mut store = PasswordStore::new();

		let (encryption, decryption) = enc_dec(&[Aes, Twofish, Serpent]);
		let id = store.create(&token, "gmail", "S3cr!", encryption, decryption).unwrap();
		store.save(&path).unwrap();

		let loaded = PasswordStore::load(&path).unwrap();
		assert_eq!(loaded, store);
		assert_eq!(loaded.find_by_id(&token, id).unwrap().unwrap().password, "S3cr!");
	}

	// Serialization must be deterministic so identical stores write
	// identical bytes.
	#[test]
	fn test_deterministic_serialization() {
		let token = token();
		let mut store = PasswordStore::new();
		for i in 0..8 {
			let (encryption, decryption) = enc_dec(&[Sm4]);
			store.create(&token, &format!("entry {i}"), "pw", encryption, decryption).unwrap();
		}

		let serialized = serde_json::to_string(&store).unwrap();
		for _ in 0..16 {
			let copy: PasswordStore = serde_json::from_str(&serialized).unwrap();
			assert_eq!(serde_json::to_string(&copy).unwrap(), serialized);
		}
	}

	#[test]
	fn test_truncated_store_is_rejected_and_not_rewritten() {
		let tmp_dir = tempdir().unwrap();
		let path = tmp_dir.path().join("store.password.json");
		let token = token();
		let mut store = PasswordStore::new();

		let (encryption, decryption) = enc_dec(&[Aes]);
		store.create(&token, "gmail", "S3cr!", encryption, decryption).unwrap();
		store.save(&path).unwrap();

		let mut data = std::fs::read(&path).unwrap();
		data.truncate(data.len() - 1);
		std::fs::write(&path, &data).unwrap();

		assert!(matches!(PasswordStore::load(&path), Err(VaultError::StoreCorrupt(_))));
		assert_eq!(std::fs::read(&path).unwrap(), data);
	}

	#[test]
	fn test_unknown_algorithm_name_is_rejected_at_load() {
		let tmp_dir = tempdir().unwrap();
		let path = tmp_dir.path().join("store.password.json");
		let token = token();
		let mut store = PasswordStore::new();

		let (encryption, decryption) = enc_dec(&[Aes]);
		store.create(&token, "gmail", "S3cr!", encryption, decryption).unwrap();
		store.save(&path).unwrap();

		let data = std::fs::read_to_string(&path).unwrap().replace("\"AES\"", "\"DES\"");
		std::fs::write(&path, data).unwrap();

		assert!(matches!(PasswordStore::load(&path), Err(VaultError::StoreCorrupt(_))));
	}

	#[test]
	fn test_tampered_wrapped_key_is_rejected() {
		let token = token();
		let mut store = PasswordStore::new();
		let (encryption, decryption) = enc_dec(&[Aes]);
		let id = store.create(&token, "gmail", "S3cr!", encryption, decryption).unwrap();

		// Swap in a wrapped key that doesn't match the stored fingerprint.
		let hashmap_id = store.instances()[0].hashmap_id();
		let mut wrapped = store.key_maps.wrapped(hashmap_id).unwrap().clone();
		wrapped.0[0] ^= 1;
		store.key_maps.replace_one(hashmap_id, wrapped).unwrap();

		assert!(matches!(store.find_by_id(&token, id), Err(VaultError::MasterKeyMismatch)));
	}
}
