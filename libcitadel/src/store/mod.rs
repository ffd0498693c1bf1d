// Methodology Note:
// Each store owns its instance list AND the two wrapped-key maps, and every
// mutation goes through a store method that updates them together.  The maps
// are keyed by `hashmap_id` and an instance is only ever valid with entries
// in both, so callers are never handed a way to break that pairing.  The
// fields stay private and the serialized form is validated on load for the
// same reason: a store that deserializes successfully upholds the invariant.

mod file;
mod password;

pub use self::{
	file::{FileInstance, FileStore},
	password::{PasswordInstance, PasswordStore, UnlockedEntry},
};

use crate::errors::VaultError;
use citadelcrypto::{self as crypto, decrypt_cascade, encrypt_cascade, CipherAlgorithm, CryptoError, InstanceKey, MasterKey};
use data_encoding::BASE64;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use subtle::ConstantTimeEq;


/// A per-instance key encrypted under the master key via the instance's own
/// cascade.  Serialized as Base64.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct WrappedKey(pub Vec<u8>);

impl Serialize for WrappedKey {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str(&BASE64.encode(&self.0))
	}
}

impl<'de> Deserialize<'de> for WrappedKey {
	fn deserialize<D>(deserializer: D) -> Result<WrappedKey, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		BASE64.decode(s.as_bytes()).map(WrappedKey).map_err(serde::de::Error::custom)
	}
}


/// The wrapped-key map and its companion fingerprint map.  For every id the
/// fingerprint is SHA-512 of the unwrapped key, so a wrong master key (or a
/// tampered wrapped key) is detected without ever exposing key material.
#[derive(Serialize, Deserialize, Eq, PartialEq, Debug, Clone, Default)]
pub(crate) struct KeyMaps {
	#[serde(serialize_with = "ordered_id_map", deserialize_with = "id_map")]
	wrapped_keys: HashMap<u64, WrappedKey>,
	#[serde(serialize_with = "ordered_id_map", deserialize_with = "id_map")]
	unwrapped_key_hashes: HashMap<u64, String>,
}

impl KeyMaps {
	pub fn next_id(&self) -> u64 {
		self.wrapped_keys.keys().max().map_or(1, |max| max + 1)
	}

	pub fn len(&self) -> usize {
		self.wrapped_keys.len()
	}

	pub fn insert(&mut self, hashmap_id: u64, wrapped_key: WrappedKey, key_hash: String) -> Result<(), VaultError> {
		if self.wrapped_keys.contains_key(&hashmap_id) || self.unwrapped_key_hashes.contains_key(&hashmap_id) {
			return Err(VaultError::DuplicateIdentifier(hashmap_id));
		}
		self.wrapped_keys.insert(hashmap_id, wrapped_key);
		self.unwrapped_key_hashes.insert(hashmap_id, key_hash);
		Ok(())
	}

	/// Wraps a freshly generated instance key under the master key.
	pub fn wrap_new_key(&mut self, hashmap_id: u64, key: &InstanceKey, master_key: &MasterKey, encryption: &[CipherAlgorithm]) -> Result<(), VaultError> {
		let wrapped = encrypt_cascade(&key[..], &master_key[..], encryption, b"")?;
		self.insert(hashmap_id, WrappedKey(wrapped), crypto::key_fingerprint(key))
	}

	/// Unwraps an instance key and verifies its fingerprint.  Any failure
	/// that can only come from the wrong master key reports
	/// `MasterKeyMismatch`; the caller never sees a wrongly decrypted key.
	pub fn unwrap_key(&self, hashmap_id: u64, master_key: &MasterKey, decryption: &[CipherAlgorithm]) -> Result<InstanceKey, VaultError> {
		let wrapped = self.wrapped_keys.get(&hashmap_id).ok_or(VaultError::StoreCorrupt("missing wrapped key"))?;
		let expected = self.unwrapped_key_hashes.get(&hashmap_id).ok_or(VaultError::StoreCorrupt("missing key fingerprint"))?;

		let mut raw = decrypt_cascade(&wrapped.0, &master_key[..], decryption, b"").map_err(|e| match e {
			CryptoError::CipherIntegrity => VaultError::MasterKeyMismatch,
			other => VaultError::Crypto(other),
		})?;

		let key = InstanceKey::from_slice(&raw).ok_or(VaultError::MasterKeyMismatch);
		crypto::wipe(&mut raw);
		let key = key?;

		let fingerprint = crypto::key_fingerprint(&key);
		if !bool::from(fingerprint.as_bytes().ct_eq(expected.as_bytes())) {
			return Err(VaultError::MasterKeyMismatch);
		}

		Ok(key)
	}

	/// Re-wraps one key under a new master key without touching the map.
	/// Used by rotation, which collects every new wrapped key before
	/// replacing anything.
	pub fn rewrapped(
		&self,
		hashmap_id: u64,
		old_master_key: &MasterKey,
		new_master_key: &MasterKey,
		encryption: &[CipherAlgorithm],
		decryption: &[CipherAlgorithm],
	) -> Result<WrappedKey, VaultError> {
		let key = self.unwrap_key(hashmap_id, old_master_key, decryption)?;
		Ok(WrappedKey(encrypt_cascade(&key[..], &new_master_key[..], encryption, b"")?))
	}

	/// Replaces the wrapped keys wholesale; the fingerprints are unchanged
	/// because rotation never changes the instance keys themselves.
	pub fn replace_wrapped(&mut self, wrapped_keys: HashMap<u64, WrappedKey>) {
		debug_assert_eq!(wrapped_keys.len(), self.wrapped_keys.len());
		self.wrapped_keys = wrapped_keys;
	}

	/// Replaces the wrapped key of a single instance, fingerprint unchanged.
	pub fn replace_one(&mut self, hashmap_id: u64, wrapped_key: WrappedKey) -> Result<(), VaultError> {
		match self.wrapped_keys.get_mut(&hashmap_id) {
			Some(entry) => {
				*entry = wrapped_key;
				Ok(())
			}
			None => Err(VaultError::StoreCorrupt("missing wrapped key")),
		}
	}

	pub fn remove(&mut self, hashmap_id: u64) {
		self.wrapped_keys.remove(&hashmap_id);
		self.unwrapped_key_hashes.remove(&hashmap_id);
	}

	pub fn clear(&mut self) {
		self.wrapped_keys.clear();
		self.unwrapped_key_hashes.clear();
	}

	pub fn wrapped(&self, hashmap_id: u64) -> Option<&WrappedKey> {
		self.wrapped_keys.get(&hashmap_id)
	}

	pub fn fingerprint(&self, hashmap_id: u64) -> Option<&str> {
		self.unwrapped_key_hashes.get(&hashmap_id).map(String::as_str)
	}

	/// Checks the deserialized maps against the instance list: every
	/// instance id present in both maps, no orphaned map entries.
	pub fn validate(&self, hashmap_ids: &[u64]) -> Result<(), VaultError> {
		for &id in hashmap_ids {
			if !self.wrapped_keys.contains_key(&id) {
				return Err(VaultError::StoreCorrupt("instance without wrapped key"));
			}
			if !self.unwrapped_key_hashes.contains_key(&id) {
				return Err(VaultError::StoreCorrupt("instance without key fingerprint"));
			}
		}
		if self.wrapped_keys.len() != hashmap_ids.len() || self.unwrapped_key_hashes.len() != hashmap_ids.len() {
			return Err(VaultError::StoreCorrupt("orphaned wrapped-key entries"));
		}
		Ok(())
	}
}


/// Rejects algorithm lists that are empty or not each other's reverse.
pub(crate) fn validate_cascade_pair(encryption: &[CipherAlgorithm], decryption: &[CipherAlgorithm]) -> Result<(), VaultError> {
	if !crypto::is_reverse_pair(encryption, decryption) {
		return Err(VaultError::Crypto(CryptoError::InvalidAlgorithm));
	}
	Ok(())
}

/// Rejects duplicate ids in a deserialized instance list.
pub(crate) fn validate_unique_ids(ids: impl Iterator<Item = u64>) -> Result<(), VaultError> {
	let mut seen = std::collections::HashSet::new();
	for id in ids {
		if !seen.insert(id) {
			return Err(VaultError::StoreCorrupt("duplicate identifier"));
		}
	}
	Ok(())
}


// The id maps are serialized with decimal-string keys (JSON objects only
// have string keys) in ascending id order, so the same store always writes
// the same bytes.
fn ordered_id_map<S, V>(value: &HashMap<u64, V>, serializer: S) -> Result<S::Ok, S::Error>
where
	S: serde::Serializer,
	V: Serialize,
{
	use serde::ser::SerializeMap;

	let ordered: BTreeMap<u64, &V> = value.iter().map(|(k, v)| (*k, v)).collect();
	let mut map = serializer.serialize_map(Some(ordered.len()))?;
	for (k, v) in ordered {
		map.serialize_entry(&k.to_string(), v)?;
	}
	map.end()
}

fn id_map<'de, D, V>(deserializer: D) -> Result<HashMap<u64, V>, D::Error>
where
	D: serde::Deserializer<'de>,
	V: Deserialize<'de>,
{
	let raw: HashMap<String, V> = HashMap::deserialize(deserializer)?;
	raw.into_iter()
		.map(|(k, v)| k.parse::<u64>().map(|k| (k, v)).map_err(serde::de::Error::custom))
		.collect()
}


#[cfg(test)]
mod tests {
	use super::{KeyMaps, WrappedKey};
	use crate::errors::VaultError;
	use citadelcrypto::{generate_instance_key, master_key_from_token, CipherAlgorithm};

	#[test]
	fn test_wrap_unwrap_round_trip() {
		let mut maps = KeyMaps::default();
		let master = master_key_from_token(b"token");
		let key = generate_instance_key();
		let encryption = [CipherAlgorithm::Aes, CipherAlgorithm::Serpent];
		let decryption = [CipherAlgorithm::Serpent, CipherAlgorithm::Aes];

		maps.wrap_new_key(1, &key, &master, &encryption).unwrap();
		assert_eq!(maps.unwrap_key(1, &master, &decryption).unwrap(), key);
	}

	#[test]
	fn test_unwrap_with_wrong_master_key() {
		let mut maps = KeyMaps::default();
		let master = master_key_from_token(b"token");
		let wrong = master_key_from_token(b"other token");
		let key = generate_instance_key();
		let encryption = [CipherAlgorithm::Sm4];
		let decryption = [CipherAlgorithm::Sm4];

		maps.wrap_new_key(1, &key, &master, &encryption).unwrap();
		assert!(matches!(maps.unwrap_key(1, &wrong, &decryption), Err(VaultError::MasterKeyMismatch)));
	}

	#[test]
	fn test_duplicate_id_rejected() {
		let mut maps = KeyMaps::default();
		let master = master_key_from_token(b"token");
		let encryption = [CipherAlgorithm::Aes];

		maps.wrap_new_key(7, &generate_instance_key(), &master, &encryption).unwrap();
		assert!(matches!(
			maps.wrap_new_key(7, &generate_instance_key(), &master, &encryption),
			Err(VaultError::DuplicateIdentifier(7))
		));
	}

	#[test]
	fn test_rewrap_preserves_key_and_fingerprint() {
		let mut maps = KeyMaps::default();
		let old_master = master_key_from_token(b"old");
		let new_master = master_key_from_token(b"new");
		let key = generate_instance_key();
		let encryption = [CipherAlgorithm::Twofish, CipherAlgorithm::Rc6];
		let decryption = [CipherAlgorithm::Rc6, CipherAlgorithm::Twofish];

		maps.wrap_new_key(1, &key, &old_master, &encryption).unwrap();
		let fingerprint = maps.fingerprint(1).unwrap().to_owned();

		let rewrapped = maps.rewrapped(1, &old_master, &new_master, &encryption, &decryption).unwrap();
		assert_ne!(Some(&rewrapped), maps.wrapped(1));
		maps.replace_one(1, rewrapped).unwrap();

		assert_eq!(maps.unwrap_key(1, &new_master, &decryption).unwrap(), key);
		assert!(matches!(maps.unwrap_key(1, &old_master, &decryption), Err(VaultError::MasterKeyMismatch)));
		assert_eq!(maps.fingerprint(1).unwrap(), fingerprint);
	}

	#[test]
	fn test_validate() {
		let mut maps = KeyMaps::default();
		let master = master_key_from_token(b"token");
		let encryption = [CipherAlgorithm::Aes];

		maps.wrap_new_key(1, &generate_instance_key(), &master, &encryption).unwrap();
		maps.wrap_new_key(2, &generate_instance_key(), &master, &encryption).unwrap();

		assert!(maps.validate(&[1, 2]).is_ok());
		assert!(maps.validate(&[1]).is_err());
		assert!(maps.validate(&[1, 2, 3]).is_err());

		maps.remove(2);
		assert!(maps.validate(&[1]).is_ok());

		maps.insert(3, WrappedKey(vec![0u8; 48]), "bogus".to_owned()).unwrap();
		assert!(maps.validate(&[1]).is_err());
	}
}
