//! Sector-level crypt operations over a key-sector slot and a payload buffer.
//!
//! Each payload sector has its own random key. The key lives in its zone's key
//! sector, wrapped under a key-key derived from the master key and the
//! sector's logical offset, so a slot copied to another position is useless.

use rand::RngCore;

use crate::cipher::{sector_iv, SectorCipher};
use crate::keys::{derive_kkey, generate_sector_key, unwrap_sector_key, wrap_sector_key};
use crate::{MKEY_LEN, SALT_LEN, SKEY_LEN};

pub struct SectorCrypter<'a> {
    mkey: &'a [u8; MKEY_LEN],
    salt: &'a [u8; SALT_LEN],
    cipher: &'a dyn SectorCipher,
}

impl<'a> SectorCrypter<'a> {
    pub fn new(
        mkey: &'a [u8; MKEY_LEN],
        salt: &'a [u8; SALT_LEN],
        cipher: &'a dyn SectorCipher,
    ) -> Self {
        Self { mkey, salt, cipher }
    }

    /// Decrypt one sector in place using the key held in `slot`.
    ///
    /// `offset` is the sector's logical byte offset.
    pub fn decrypt(&self, offset: u64, slot: &[u8], data: &mut [u8]) -> anyhow::Result<()> {
        let slot = slot_ref(slot)?;
        let kkey = derive_kkey(self.mkey, self.salt, offset)?;
        let skey = unwrap_sector_key(&kkey, slot);
        self.cipher.decrypt(skey.as_bytes(), &sector_iv(offset), data);
        Ok(())
    }

    /// Encrypt `plaintext` into `out` under a fresh random key and store the
    /// wrapped key in `slot`.
    pub fn encrypt(
        &self,
        offset: u64,
        slot: &mut [u8],
        plaintext: &[u8],
        out: &mut [u8],
    ) -> anyhow::Result<()> {
        if plaintext.len() != out.len() {
            anyhow::bail!(
                "sector buffer size mismatch: {} bytes in, {} bytes out",
                plaintext.len(),
                out.len()
            );
        }
        if slot.len() != SKEY_LEN {
            anyhow::bail!("key slot must be {SKEY_LEN} bytes, got {}", slot.len());
        }

        let skey = generate_sector_key();
        out.copy_from_slice(plaintext);
        self.cipher.encrypt(skey.as_bytes(), &sector_iv(offset), out);

        let kkey = derive_kkey(self.mkey, self.salt, offset)?;
        slot.copy_from_slice(&wrap_sector_key(&kkey, &skey));
        Ok(())
    }

    /// Replace the key in `slot` with random bytes. The old contents of the
    /// sector can no longer be decrypted.
    pub fn erase(&self, slot: &mut [u8]) {
        rand::thread_rng().fill_bytes(slot);
    }
}

fn slot_ref(slot: &[u8]) -> anyhow::Result<&[u8; SKEY_LEN]> {
    slot.try_into()
        .map_err(|_| anyhow::anyhow!("key slot must be {SKEY_LEN} bytes, got {}", slot.len()))
}
