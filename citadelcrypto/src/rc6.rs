//! RC6-32/20 block cipher (Rivest, Robshaw, Sidney, Yin).
//!
//! The cascade needs RC6 alongside the RustCrypto ciphers and there is no
//! vetted registry crate for it, so the key schedule and block function live
//! here, checked against the test vectors published with the cipher.  The
//! `cipher` traits are implemented so `cbc` can drive it exactly like the
//! other four.

use cipher::{
	consts::{U16, U32},
	BlockCipher, Key, KeyInit, KeySizeUser,
};

const ROUNDS: usize = 20;
const SCHEDULE_WORDS: usize = 2 * ROUNDS + 4;

const P32: u32 = 0xb7e1_5163;
const Q32: u32 = 0x9e37_79b9;


pub struct Rc6 {
	schedule: [u32; SCHEDULE_WORDS],
}

impl Rc6 {
	/// Key schedule for any key length that is a positive multiple of four
	/// bytes; the `KeySizeUser` impl fixes the cascade's key at 32 bytes.
	fn expand(key: &[u8]) -> Rc6 {
		assert!(!key.is_empty() && key.len() % 4 == 0, "bad RC6 key length");

		let mut l: Vec<u32> = key.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().expect("internal error"))).collect();

		let mut s = [0u32; SCHEDULE_WORDS];
		s[0] = P32;
		for i in 1..SCHEDULE_WORDS {
			s[i] = s[i - 1].wrapping_add(Q32);
		}

		let mut a = 0u32;
		let mut b = 0u32;
		let mut i = 0;
		let mut j = 0;
		for _ in 0..(3 * SCHEDULE_WORDS.max(l.len())) {
			a = s[i].wrapping_add(a).wrapping_add(b).rotate_left(3);
			s[i] = a;
			b = l[j].wrapping_add(a).wrapping_add(b).rotate_left(a.wrapping_add(b));
			l[j] = b;
			i = (i + 1) % SCHEDULE_WORDS;
			j = (j + 1) % l.len();
		}

		crate::wipe_u32(&mut l);

		Rc6 { schedule: s }
	}

	fn encrypt_words(&self, mut a: u32, mut b: u32, mut c: u32, mut d: u32) -> (u32, u32, u32, u32) {
		b = b.wrapping_add(self.schedule[0]);
		d = d.wrapping_add(self.schedule[1]);
		for r in 1..=ROUNDS {
			let t = b.wrapping_mul(b.wrapping_add(b).wrapping_add(1)).rotate_left(5);
			let u = d.wrapping_mul(d.wrapping_add(d).wrapping_add(1)).rotate_left(5);
			a = (a ^ t).rotate_left(u).wrapping_add(self.schedule[2 * r]);
			c = (c ^ u).rotate_left(t).wrapping_add(self.schedule[2 * r + 1]);
			(a, b, c, d) = (b, c, d, a);
		}
		a = a.wrapping_add(self.schedule[2 * ROUNDS + 2]);
		c = c.wrapping_add(self.schedule[2 * ROUNDS + 3]);

		(a, b, c, d)
	}

	fn decrypt_words(&self, mut a: u32, mut b: u32, mut c: u32, mut d: u32) -> (u32, u32, u32, u32) {
		c = c.wrapping_sub(self.schedule[2 * ROUNDS + 3]);
		a = a.wrapping_sub(self.schedule[2 * ROUNDS + 2]);
		for r in (1..=ROUNDS).rev() {
			(a, b, c, d) = (d, a, b, c);
			let u = d.wrapping_mul(d.wrapping_add(d).wrapping_add(1)).rotate_left(5);
			let t = b.wrapping_mul(b.wrapping_add(b).wrapping_add(1)).rotate_left(5);
			c = c.wrapping_sub(self.schedule[2 * r + 1]).rotate_right(t) ^ u;
			a = a.wrapping_sub(self.schedule[2 * r]).rotate_right(u) ^ t;
		}
		d = d.wrapping_sub(self.schedule[1]);
		b = b.wrapping_sub(self.schedule[0]);

		(a, b, c, d)
	}
}

impl BlockCipher for Rc6 {}

impl KeySizeUser for Rc6 {
	type KeySize = U32;
}

impl KeyInit for Rc6 {
	fn new(key: &Key<Self>) -> Self {
		Rc6::expand(&key[..])
	}
}

cipher::impl_simple_block_encdec!(
	Rc6, U16, cipher, block,
	encrypt: {
		let data = block.get_in();
		let a = u32::from_le_bytes(data[0..4].try_into().expect("internal error"));
		let b = u32::from_le_bytes(data[4..8].try_into().expect("internal error"));
		let c = u32::from_le_bytes(data[8..12].try_into().expect("internal error"));
		let d = u32::from_le_bytes(data[12..16].try_into().expect("internal error"));

		let (a, b, c, d) = cipher.encrypt_words(a, b, c, d);

		let data = block.get_out();
		data[0..4].copy_from_slice(&a.to_le_bytes());
		data[4..8].copy_from_slice(&b.to_le_bytes());
		data[8..12].copy_from_slice(&c.to_le_bytes());
		data[12..16].copy_from_slice(&d.to_le_bytes());
	}
	decrypt: {
		let data = block.get_in();
		let a = u32::from_le_bytes(data[0..4].try_into().expect("internal error"));
		let b = u32::from_le_bytes(data[4..8].try_into().expect("internal error"));
		let c = u32::from_le_bytes(data[8..12].try_into().expect("internal error"));
		let d = u32::from_le_bytes(data[12..16].try_into().expect("internal error"));

		let (a, b, c, d) = cipher.decrypt_words(a, b, c, d);

		let data = block.get_out();
		data[0..4].copy_from_slice(&a.to_le_bytes());
		data[4..8].copy_from_slice(&b.to_le_bytes());
		data[8..12].copy_from_slice(&c.to_le_bytes());
		data[12..16].copy_from_slice(&d.to_le_bytes());
	}
);

impl Drop for Rc6 {
	fn drop(&mut self) {
		crate::wipe_u32(&mut self.schedule);
	}
}


#[cfg(test)]
mod tests {
	use super::Rc6;
	use cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
	use data_encoding::HEXLOWER;
	use rand::{rngs::OsRng, RngCore, TryRngCore};

	fn hex(s: &str) -> Vec<u8> {
		HEXLOWER.decode(s.as_bytes()).unwrap()
	}

	// Published RC6-32/20/16 test vectors.
	#[test]
	fn test_published_vectors() {
		let vectors = [
			("00000000000000000000000000000000", "00000000000000000000000000000000", "8fc3a53656b1f778c129df4e9848a41e"),
			("0123456789abcdef0112233445566778", "02132435465768798a9bacbdcedfe0f1", "524e192f4715c6231f51f6367ea43f18"),
		];

		for (key, plaintext, ciphertext) in vectors {
			let cipher = Rc6::expand(&hex(key));
			let mut block = GenericArray::clone_from_slice(&hex(plaintext));

			cipher.encrypt_block(&mut block);
			assert_eq!(&block[..], &hex(ciphertext)[..]);

			cipher.decrypt_block(&mut block);
			assert_eq!(&block[..], &hex(plaintext)[..]);
		}
	}

	// The cascade feeds RC6 32-byte keys through `KeyInit`; make sure that
	// path round-trips too.
	#[test]
	fn test_cascade_key_size_round_trip() {
		let mut rng = OsRng.unwrap_err();
		let mut key = [0u8; 32];
		rng.fill_bytes(&mut key);
		let cipher = Rc6::new_from_slice(&key).unwrap();

		for _ in 0..64 {
			let mut original = [0u8; 16];
			rng.fill_bytes(&mut original);
			let mut block = GenericArray::clone_from_slice(&original);

			cipher.encrypt_block(&mut block);
			assert_ne!(&block[..], &original[..]);

			cipher.decrypt_block(&mut block);
			assert_eq!(&block[..], &original[..]);
		}
	}
}
