//! Key-location table: where the lock copies live, and how to decrypt them.
//!
//! The table is one cleartext sector (physical sector 0, or an external lock
//! file) holding the KDF salt and one obfuscated 16-byte slot per lock copy:
//!
//! ```text
//! kdf salt [16] | slot 0 [16] | slot 1 [16] | slot 2 [16] | slot 3 [16] | random
//! ```
//!
//! Slot `i` is `le64(lsector) || 8 random bytes`, XORed with an ARC4 stream
//! seeded from `keymat || i`. The next 32 bytes of that stream are the key
//! and IV of lock copy `i`. Without the passphrase a slot is indistinguishable
//! from random fill.

use anyhow::Context;
use gbde_core::{BdeError, BdeResult};
use gbde_crypto::{Arc4, KeyMaterial, IV_LEN, SALT_LEN, SKEY_LEN};
use gbde_storage::BlockProvider;
use rand::RngCore;
use std::path::Path;
use zeroize::Zeroize;

use crate::key::MAXKEYS;

const SLOT_LEN: usize = 16;
const TABLE_LEN: usize = SALT_LEN + MAXKEYS * SLOT_LEN;

/// Cipher parameters of one lock copy, recovered from its slot.
pub struct LockCipherKey {
    pub key: [u8; SKEY_LEN],
    pub iv: [u8; IV_LEN],
}

impl Drop for LockCipherKey {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

impl std::fmt::Debug for LockCipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCipherKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLocTable {
    pub kdf_salt: [u8; SALT_LEN],
    pub slots: [[u8; SLOT_LEN]; MAXKEYS],
}

impl KeyLocTable {
    /// A table with a fresh salt and random slots.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut table = KeyLocTable {
            kdf_salt: [0; SALT_LEN],
            slots: [[0; SLOT_LEN]; MAXKEYS],
        };
        rng.fill_bytes(&mut table.kdf_salt);
        for slot in table.slots.iter_mut() {
            rng.fill_bytes(slot);
        }
        table
    }

    /// Serialize into a `size`-byte block, padding with random bytes.
    pub fn encode(&self, size: usize) -> Vec<u8> {
        let mut buf = vec![0u8; size.max(TABLE_LEN)];
        rand::thread_rng().fill_bytes(&mut buf[TABLE_LEN..]);
        buf[..SALT_LEN].copy_from_slice(&self.kdf_salt);
        for (i, slot) in self.slots.iter().enumerate() {
            let off = SALT_LEN + i * SLOT_LEN;
            buf[off..off + SLOT_LEN].copy_from_slice(slot);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> BdeResult<Self> {
        if buf.len() < TABLE_LEN {
            return Err(BdeError::Format(format!(
                "key-location table is {} bytes, need {TABLE_LEN}",
                buf.len()
            )));
        }
        let mut table = KeyLocTable {
            kdf_salt: [0; SALT_LEN],
            slots: [[0; SLOT_LEN]; MAXKEYS],
        };
        table.kdf_salt.copy_from_slice(&buf[..SALT_LEN]);
        for (i, slot) in table.slots.iter_mut().enumerate() {
            let off = SALT_LEN + i * SLOT_LEN;
            slot.copy_from_slice(&buf[off..off + SLOT_LEN]);
        }
        Ok(table)
    }

    /// Read the table from `lock_file`, or from physical sector 0 when no
    /// file is given.
    pub fn load(provider: &dyn BlockProvider, lock_file: Option<&Path>) -> BdeResult<Self> {
        match lock_file {
            Some(path) => {
                let buf = std::fs::read(path)
                    .with_context(|| format!("reading lock file: {}", path.display()))?;
                Self::decode(&buf)
            }
            None => {
                let mut buf = vec![0u8; provider.sector_size() as usize];
                provider
                    .read_at(0, &mut buf)
                    .map_err(|e| BdeError::sector_io(0, &e))?;
                Self::decode(&buf)
            }
        }
    }

    /// Write the table to `lock_file`, or to physical sector 0.
    pub fn store(&self, provider: &dyn BlockProvider, lock_file: Option<&Path>) -> BdeResult<()> {
        let ss = provider.sector_size() as usize;
        let buf = self.encode(ss);
        match lock_file {
            Some(path) => {
                std::fs::write(path, &buf)
                    .with_context(|| format!("writing lock file: {}", path.display()))?;
            }
            None => {
                provider
                    .write_at(0, &buf[..ss])
                    .map_err(|e| BdeError::sector_io(0, &e))?;
                provider.flush()?;
            }
        }
        Ok(())
    }
}

/// Obfuscate the location of lock copy `index` and derive its cipher key.
pub fn keyloc_encrypt(
    keymat: &KeyMaterial,
    index: usize,
    lsector: u64,
) -> ([u8; SLOT_LEN], LockCipherKey) {
    let mut slot = [0u8; SLOT_LEN];
    slot[..8].copy_from_slice(&lsector.to_le_bytes());
    rand::thread_rng().fill_bytes(&mut slot[8..]);

    let mut stream = slot_stream(keymat, index);
    stream.apply(&mut slot);
    (slot, lock_cipher_key(&mut stream))
}

/// Recover the location of lock copy `index` and its cipher key.
///
/// Always succeeds: a wrong passphrase just yields a garbage location, which
/// the caller rejects when the copy fails to verify.
pub fn keyloc_decrypt(
    keymat: &KeyMaterial,
    index: usize,
    slot: &[u8; SLOT_LEN],
) -> (u64, LockCipherKey) {
    let mut plain = *slot;
    let mut stream = slot_stream(keymat, index);
    stream.apply(&mut plain);
    let mut loc = [0u8; 8];
    loc.copy_from_slice(&plain[..8]);
    plain.zeroize();
    (u64::from_le_bytes(loc), lock_cipher_key(&mut stream))
}

fn slot_stream(keymat: &KeyMaterial, index: usize) -> Arc4 {
    let mut seed = keymat.slot_seed(index);
    let stream = Arc4::seed(&seed);
    seed.zeroize();
    stream
}

fn lock_cipher_key(stream: &mut Arc4) -> LockCipherKey {
    let mut lk = LockCipherKey {
        key: [0; SKEY_LEN],
        iv: [0; IV_LEN],
    };
    stream.fill(&mut lk.key);
    stream.fill(&mut lk.iv);
    lk
}
