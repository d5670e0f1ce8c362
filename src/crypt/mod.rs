//! Crypt Module
//!
//! Optional stream-cipher transform over a store's content bytes.
//!
//! ## Scheme
//! - AES-128 in CTR mode
//! - Cipher key = first 16 bytes of SHA-256(crypt key)
//! - 16-byte IV per content generation, stored in the meta file
//!
//! CTR mode lets an append encrypt in place: the keystream is seeked to the
//! content offset of the new bytes, so no cipher state has to be carried
//! between writes.

use std::fmt;

use aes::Aes128;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use rand::RngCore;
use sha2::{Digest, Sha256};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// IV length in bytes
pub const IV_LEN: usize = 16;

/// Cipher key length in bytes
const KEY_LEN: usize = 16;

/// Per-store cipher, keyed by the caller's crypt key
#[derive(Clone)]
pub struct Crypter {
    key: String,
    derived: [u8; KEY_LEN],
}

impl Crypter {
    /// Build a crypter for `key`; an empty key means plaintext (`None`)
    pub fn new(key: &str) -> Option<Self> {
        if key.is_empty() {
            return None;
        }

        let digest = Sha256::digest(key.as_bytes());
        let mut derived = [0u8; KEY_LEN];
        derived.copy_from_slice(&digest[..KEY_LEN]);

        Some(Self {
            key: key.to_string(),
            derived,
        })
    }

    /// The caller-supplied key this crypter was built from
    pub fn key(&self) -> &str {
        &self.key
    }

    /// XOR `buf` with the keystream starting at content `offset`.
    ///
    /// Encryption and decryption are the same operation.
    pub fn apply(&self, iv: &[u8; IV_LEN], offset: u64, buf: &mut [u8]) {
        let mut cipher = Aes128Ctr::new(
            GenericArray::from_slice(&self.derived),
            GenericArray::from_slice(iv),
        );
        cipher.seek(offset);
        cipher.apply_keystream(buf);
    }

    /// Fresh random IV
    pub fn random_iv() -> [u8; IV_LEN] {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        iv
    }
}

impl fmt::Debug for Crypter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crypter").finish_non_exhaustive()
    }
}

/// Apply an optional crypter; plaintext stores pass through untouched
pub fn transform(crypter: Option<&Crypter>, iv: &[u8; IV_LEN], offset: u64, buf: &mut [u8]) {
    if let Some(c) = crypter {
        c.apply(iv, offset, buf);
    }
}
