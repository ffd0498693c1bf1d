use super::{validate_cascade_pair, validate_unique_ids, KeyMaps, WrappedKey};
use crate::errors::VaultError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use citadelcrypto::{self as crypto, decrypt_cascade, encrypt_cascade, CipherAlgorithm, CryptoError, InstanceKey, MasterKey, BLOCK_SIZE};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
	fs::File,
	io::{self, BufReader, BufWriter, Read, Write},
	path::Path,
};
use tempfile::NamedTempFile;


// Encrypted payload framing.  The plaintext is processed in chunks of
// CHUNK_SIZE bytes, each run through the cascade as its own message with the
// chunk index as context; a full chunk therefore always encrypts to exactly
// CHUNK_SIZE + BLOCK_SIZE bytes (PKCS#7 adds a whole block), which makes the
// stream self-delimiting: only the final encrypted chunk may be shorter.
const FILE_MAGIC: &[u8; 9] = b"citadel1\0";
const CHUNK_SIZE: usize = 64 * 1024;


/// One encrypted-file reference.  The ciphertext is not inline; it lives in a
/// sibling payload file named after the instance id.
#[derive(Serialize, Deserialize, Eq, PartialEq, Debug, Clone)]
pub struct FileInstance {
	id: u64,
	encryption_algorithms: Vec<CipherAlgorithm>,
	decryption_algorithms: Vec<CipherAlgorithm>,
	hashmap_id: u64,
}

impl FileInstance {
	pub fn id(&self) -> u64 {
		self.id
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


#[derive(Serialize, Deserialize, Eq, PartialEq, Debug, Clone, Default)]
pub struct FileStore {
	instances: Vec<FileInstance>,
	#[serde(flatten)]
	key_maps: KeyMaps,
}

impl FileStore {
	pub fn new() -> FileStore {
		Default::default()
	}

	pub fn len(&self) -> usize {
		self.instances.len()
	}

	pub fn is_empty(&self) -> bool {
		self.instances.is_empty()
	}

	pub fn instances(&self) -> &[FileInstance] {
		&self.instances
	}

	pub fn get(&self, id: u64) -> Option<&FileInstance> {
		self.instances.iter().find(|i| i.id == id)
	}

	fn next_instance_id(&self) -> u64 {
		self.instances.iter().map(|i| i.id).max().map_or(1, |max| max + 1)
	}

	/// Creates a new file instance: a fresh per-instance key, wrapped and
	/// fingerprinted exactly like a password instance.  Returns the id.
	pub fn create(&mut self, token: &crate::Token, encryption_algorithms: Vec<CipherAlgorithm>, decryption_algorithms: Vec<CipherAlgorithm>) -> Result<u64, VaultError> {
		validate_cascade_pair(&encryption_algorithms, &decryption_algorithms)?;

		let id = self.next_instance_id();
		let hashmap_id = self.key_maps.next_id();
		let master_key = token.master_key();
		let key = crypto::generate_instance_key();

		self.key_maps.wrap_new_key(hashmap_id, &key, &master_key, &encryption_algorithms)?;

		self.instances.push(FileInstance {
			id,
			encryption_algorithms,
			decryption_algorithms,
			hashmap_id,
		});

		Ok(id)
	}

	pub fn append(&mut self, instance: FileInstance, wrapped_key: WrappedKey, key_hash: String) -> Result<(), VaultError> {
		validate_cascade_pair(&instance.encryption_algorithms, &instance.decryption_algorithms)?;
		if self.instances.iter().any(|i| i.id == instance.id) {
			return Err(VaultError::DuplicateIdentifier(instance.id));
		}
		self.key_maps.insert(instance.hashmap_id, wrapped_key, key_hash)?;
		self.instances.push(instance);
		Ok(())
	}

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

	/// Streams `source` through the instance's cascade into `destination`.
	/// The destination only ever appears complete: output goes to a
	/// temporary sibling which is fsynced and renamed over on success.
	pub fn encrypt_file(&self, token: &crate::Token, id: u64, source: &Path, destination: &Path) -> Result<(), VaultError> {
		let (instance, key) = self.unlock_instance(token, id)?;

		let mut reader = BufReader::new(File::open(source)?);
		let temp_file = write_to_temp(destination, |writer| {
			writer.write_all(FILE_MAGIC)?;
			writer.write_u32::<LittleEndian>(CHUNK_SIZE as u32)?;

			let mut chunk = vec![0u8; CHUNK_SIZE];
			let mut index: u64 = 0;
			loop {
				let filled = read_fill(&mut reader, &mut chunk)?;
				if filled == 0 {
					break;
				}

				let ciphertext = encrypt_cascade(&chunk[..filled], &key[..], &instance.encryption_algorithms, &index.to_le_bytes())?;
				writer.write_all(&ciphertext)?;

				index += 1;
				if filled < CHUNK_SIZE {
					break;
				}
			}
			Ok(())
		});

		let temp_file = temp_file.map_err(|e| {
			warn!("encryption of file instance {id} failed: {e}");
			e
		})?;

		persist_temp(temp_file, destination)
	}

	/// Inverse of `encrypt_file`.  Rejects unknown framing before touching
	/// the cascade; on any failure the partial plaintext never appears at
	/// `destination`.
	pub fn decrypt_file(&self, token: &crate::Token, id: u64, source: &Path, destination: &Path) -> Result<(), VaultError> {
		let (instance, key) = self.unlock_instance(token, id)?;

		let mut reader = BufReader::new(File::open(source)?);

		let mut magic = [0u8; FILE_MAGIC.len()];
		read_header(&mut reader, &mut magic)?;
		if &magic != FILE_MAGIC {
			return Err(VaultError::Crypto(CryptoError::UnsupportedVersion));
		}

		let chunk_size = reader.read_u32::<LittleEndian>().map_err(map_header_error)? as usize;
		if chunk_size == 0 || chunk_size % BLOCK_SIZE != 0 || chunk_size > 256 * 1024 * 1024 {
			return Err(VaultError::Crypto(CryptoError::CipherIntegrity));
		}

		let temp_file = write_to_temp(destination, |writer| {
			let mut unit = vec![0u8; chunk_size + BLOCK_SIZE];
			let mut index: u64 = 0;
			loop {
				let filled = read_fill(&mut reader, &mut unit)?;
				if filled == 0 {
					break;
				}

				let plaintext = decrypt_cascade(&unit[..filled], &key[..], &instance.decryption_algorithms, &index.to_le_bytes())?;
				writer.write_all(&plaintext)?;

				index += 1;
				if filled < unit.len() {
					break;
				}
			}
			Ok(())
		});

		let temp_file = temp_file.map_err(|e| {
			warn!("decryption of file instance {id} failed: {e}");
			e
		})?;

		persist_temp(temp_file, destination)
	}

	fn unlock_instance(&self, token: &crate::Token, id: u64) -> Result<(&FileInstance, InstanceKey), VaultError> {
		let instance = self.get(id).ok_or(VaultError::UnknownInstance(id))?;
		let master_key = token.master_key();
		let key = self.key_maps.unwrap_key(instance.hashmap_id, &master_key, &instance.decryption_algorithms)?;
		Ok((instance, key))
	}

	/// Re-wraps every instance key under a new master key; all-or-nothing,
	/// in memory.
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

	pub fn load(path: &Path) -> Result<FileStore, VaultError> {
		let data = std::fs::read(path)?;
		let store: FileStore = serde_json::from_slice(&data).map_err(|e| {
			warn!("file store at {} failed to parse: {e}", path.display());
			VaultError::StoreCorrupt("malformed file store")
		})?;
		store.validate()?;
		Ok(store)
	}

	fn validate(&self) -> Result<(), VaultError> {
		validate_unique_ids(self.instances.iter().map(|i| i.id))?;
		validate_unique_ids(self.instances.iter().map(|i| i.hashmap_id))?;

		for instance in &self.instances {
			validate_cascade_pair(&instance.encryption_algorithms, &instance.decryption_algorithms)?;
		}

		let hashmap_ids: Vec<u64> = self.instances.iter().map(|i| i.hashmap_id).collect();
		self.key_maps.validate(&hashmap_ids)
	}
}


/// Reads until the buffer is full or the stream ends; returns bytes read.
fn read_fill<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
	let mut filled = 0;
	while filled < buffer.len() {
		match reader.read(&mut buffer[filled..]) {
			Ok(0) => break,
			Ok(n) => filled += n,
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => return Err(e),
		}
	}
	Ok(filled)
}

fn read_header<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<(), VaultError> {
	reader.read_exact(buffer).map_err(map_header_error)
}

fn map_header_error(e: io::Error) -> VaultError {
	if e.kind() == io::ErrorKind::UnexpectedEof {
		VaultError::Crypto(CryptoError::TruncatedData)
	} else {
		VaultError::Io(e)
	}
}

/// Runs `body` against a buffered writer over a temporary file in the
/// destination's directory.  The temporary file is deleted on drop, so an
/// error in `body` leaves no partial output behind.
fn write_to_temp<F>(destination: &Path, body: F) -> Result<NamedTempFile, VaultError>
where
	F: FnOnce(&mut dyn Write) -> Result<(), VaultError>,
{
	let parent = destination.parent().ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Bad path"))?;
	let mut temp_file = NamedTempFile::new_in(parent)?;

	{
		let mut writer = BufWriter::new(temp_file.as_file_mut());
		body(&mut writer)?;
		writer.flush()?;
	}

	Ok(temp_file)
}

fn persist_temp(temp_file: NamedTempFile, destination: &Path) -> Result<(), VaultError> {
	temp_file.as_file().sync_all()?;
	temp_file.into_temp_path().persist(destination).map_err(|e| VaultError::Io(e.error))?;
	Ok(())
}
