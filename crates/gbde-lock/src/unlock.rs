//! Recover the key/zone map from a passphrase.

use gbde_core::{BdeError, BdeResult};
use gbde_crypto::{derive_keymat, Aes128Ctr, KdfParams, KeyMaterial, SectorCipher};
use gbde_storage::BlockProvider;
use secrecy::SecretString;
use zeroize::Zeroizing;

use crate::codec::decode_lock;
use crate::key::{BdeKey, LOCKSIZE, MAXKEYS};
use crate::keyloc::{keyloc_decrypt, KeyLocTable};

/// Try every lock copy named by `table` under `secret`.
///
/// Returns the first copy that decrypts and verifies, with its index.
/// Unreadable, destroyed, or corrupt copies are skipped.
pub fn decrypt_lock(
    provider: &dyn BlockProvider,
    table: &KeyLocTable,
    secret: &SecretString,
    params: &KdfParams,
) -> BdeResult<(BdeKey, usize)> {
    let keymat = derive_keymat(secret, &table.kdf_salt, params)?;
    decrypt_lock_with(provider, table, &keymat)
}

/// As [`decrypt_lock`], with key material already derived.
pub fn decrypt_lock_with(
    provider: &dyn BlockProvider,
    table: &KeyLocTable,
    keymat: &KeyMaterial,
) -> BdeResult<(BdeKey, usize)> {
    let media_size = provider.media_size();
    let ss = provider.sector_size() as u64;

    for index in 0..MAXKEYS {
        let (lsector, lk) = keyloc_decrypt(keymat, index, &table.slots[index]);
        if lsector % ss != 0 || lsector.checked_add(ss).map_or(true, |end| end > media_size) {
            tracing::debug!(index, "lock slot does not name a sector on this device");
            continue;
        }

        let mut sector = Zeroizing::new(vec![0u8; ss as usize]);
        if let Err(e) = provider.read_at(lsector, &mut sector) {
            tracing::warn!(index, lsector, error = %e, "lock copy unreadable, skipping");
            continue;
        }
        let record = &mut sector[..LOCKSIZE];
        if record.iter().all(|b| *b == 0) {
            tracing::debug!(index, lsector, "lock copy destroyed, skipping");
            continue;
        }

        Aes128Ctr.decrypt(&lk.key, &lk.iv, record);
        let key = match decode_lock(record) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(index, lsector, error = %e, "lock copy failed verification");
                continue;
            }
        };
        if key.sectorsize as u64 != ss || key.sector_n > media_size {
            tracing::warn!(index, lsector, "lock copy does not fit this device");
            continue;
        }
        if !key.lsector.contains(&lsector) {
            tracing::warn!(index, lsector, "lock copy found at a location it does not list");
            continue;
        }

        tracing::info!(index, zone_cont = key.zone_cont, "lock recovered");
        return Ok((key, index));
    }

    Err(BdeError::KeyNotFound)
}
