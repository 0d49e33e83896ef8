//! Pluggable payload cipher.
//!
//! The engine only needs a length-preserving `encrypt(key, iv, buf)` /
//! `decrypt(key, iv, buf)` pair over whole sectors; any such cipher can be
//! slotted in behind [`SectorCipher`].

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::{IV_LEN, SKEY_LEN};

type Aes128Ctr128 = ctr::Ctr128BE<Aes128>;

pub trait SectorCipher: Send + Sync {
    /// Encrypt `buf` in place.
    fn encrypt(&self, key: &[u8; SKEY_LEN], iv: &[u8; IV_LEN], buf: &mut [u8]);

    /// Decrypt `buf` in place.
    fn decrypt(&self, key: &[u8; SKEY_LEN], iv: &[u8; IV_LEN], buf: &mut [u8]);

    fn name(&self) -> &'static str;
}

/// AES-128 in counter mode. Ciphertext is exactly as long as plaintext.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aes128Ctr;

impl SectorCipher for Aes128Ctr {
    fn encrypt(&self, key: &[u8; SKEY_LEN], iv: &[u8; IV_LEN], buf: &mut [u8]) {
        let mut cipher = Aes128Ctr128::new(key.into(), iv.into());
        cipher.apply_keystream(buf);
    }

    fn decrypt(&self, key: &[u8; SKEY_LEN], iv: &[u8; IV_LEN], buf: &mut [u8]) {
        // CTR is its own inverse
        self.encrypt(key, iv, buf);
    }

    fn name(&self) -> &'static str {
        "aes-128-ctr"
    }
}

/// IV for the sector at logical byte `offset`: `le64(offset) || 0^8`.
pub fn sector_iv(offset: u64) -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    iv[..8].copy_from_slice(&offset.to_le_bytes());
    iv
}
