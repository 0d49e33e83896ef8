//! Per-sector keys: generation, key-key derivation, and slot wrapping

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{MKEY_LEN, SALT_LEN, SKEY_LEN};

/// Key of one payload sector (or the key-key protecting it). Zeroized on drop.
#[derive(Clone)]
pub struct SectorKey {
    bytes: [u8; SKEY_LEN],
}

impl SectorKey {
    pub fn from_bytes(bytes: [u8; SKEY_LEN]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; SKEY_LEN] {
        &self.bytes
    }
}

impl Drop for SectorKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SectorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectorKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random per-sector key.
pub fn generate_sector_key() -> SectorKey {
    let mut bytes = [0u8; SKEY_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    SectorKey::from_bytes(bytes)
}

/// Derive the key-key for the sector at logical byte `offset`.
///
/// HKDF-SHA256 with the master key as input material, the lock salt as salt,
/// and `"gbde-kkey" || le64(offset)` as info.
pub fn derive_kkey(
    mkey: &[u8; MKEY_LEN],
    salt: &[u8; SALT_LEN],
    offset: u64,
) -> anyhow::Result<SectorKey> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt.as_slice()), mkey);
    let mut info = [0u8; 9 + 8];
    info[..9].copy_from_slice(b"gbde-kkey");
    info[9..].copy_from_slice(&offset.to_le_bytes());

    let mut okm = [0u8; SKEY_LEN];
    hkdf.expand(&info, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    let key = SectorKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}

/// Encrypt a sector key as a single AES-128 block under `kkey`.
pub fn wrap_sector_key(kkey: &SectorKey, skey: &SectorKey) -> [u8; SKEY_LEN] {
    let cipher = Aes128::new(GenericArray::from_slice(kkey.as_bytes()));
    let mut block = GenericArray::clone_from_slice(skey.as_bytes());
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; SKEY_LEN];
    out.copy_from_slice(&block);
    block.as_mut_slice().zeroize();
    out
}

/// Recover a sector key from its key-sector slot.
pub fn unwrap_sector_key(kkey: &SectorKey, slot: &[u8; SKEY_LEN]) -> SectorKey {
    let cipher = Aes128::new(GenericArray::from_slice(kkey.as_bytes()));
    let mut block = GenericArray::clone_from_slice(slot);
    cipher.decrypt_block(&mut block);
    let mut bytes = [0u8; SKEY_LEN];
    bytes.copy_from_slice(&block);
    block.as_mut_slice().zeroize();
    SectorKey::from_bytes(bytes)
}
