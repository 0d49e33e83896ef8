//! Lock administration: format a device, change a passphrase, destroy copies.

use gbde_core::{BdeError, BdeResult};
use gbde_crypto::{derive_keymat, Aes128Ctr, KdfParams, KeyMaterial, SectorCipher, MKEY_LEN, SALT_LEN};
use gbde_storage::BlockProvider;
use rand::{Rng, RngCore};
use secrecy::SecretString;
use std::path::Path;
use zeroize::Zeroizing;

use crate::codec::encode_lock;
use crate::key::{BdeKey, FLAG_SECT0, LOCKSIZE, MAXKEYS};
use crate::keyloc::{keyloc_encrypt, KeyLocTable};

#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    /// Payload sectors per zone; 0 selects one zone per full key sector.
    pub zone_cont: u32,
    /// Keep the key-location table in physical sector 0.
    pub reserve_sector0: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            zone_cont: 0,
            reserve_sector0: true,
        }
    }
}

/// Lay out a fresh encrypted device and write all lock copies under `secret`.
///
/// The key-location table goes to `lock_file` when given, otherwise to
/// physical sector 0, which then must be reserved.
pub fn format(
    provider: &dyn BlockProvider,
    lock_file: Option<&Path>,
    secret: &SecretString,
    params: &KdfParams,
    opts: &FormatOptions,
) -> BdeResult<BdeKey> {
    if lock_file.is_none() && !opts.reserve_sector0 {
        return Err(BdeError::Config(
            "no lock file given and sector 0 not reserved: nowhere to keep the key table".into(),
        ));
    }

    let key = new_key(provider, opts)?;
    let mut table = KeyLocTable::generate();
    let keymat = derive_keymat(secret, &table.kdf_salt, params)?;
    for index in 0..MAXKEYS {
        write_lock_copy(provider, &mut table, &keymat, &key, index)?;
    }
    table.store(provider, lock_file)?;
    provider.flush()?;

    tracing::info!(
        sector0 = key.sector0,
        sector_n = key.sector_n,
        zone_cont = key.zone_cont,
        sectorsize = key.sectorsize,
        "device formatted"
    );
    Ok(key)
}

/// Re-encrypt lock copy `index` under a new passphrase.
pub fn set_key(
    provider: &dyn BlockProvider,
    lock_file: Option<&Path>,
    key: &BdeKey,
    index: usize,
    secret: &SecretString,
    params: &KdfParams,
) -> BdeResult<()> {
    check_index(index)?;
    let mut table = KeyLocTable::load(provider, lock_file)?;
    let keymat = derive_keymat(secret, &table.kdf_salt, params)?;
    write_lock_copy(provider, &mut table, &keymat, key, index)?;
    table.store(provider, lock_file)?;
    provider.flush()?;
    tracing::info!(index, "lock copy re-keyed");
    Ok(())
}

/// Destroy lock copy `index`, or every copy when `index` is `None`.
///
/// The lock sector is zeroed and its table slot replaced with random bytes.
/// Destroying every copy makes the device permanently unreadable.
pub fn nuke(
    provider: &dyn BlockProvider,
    lock_file: Option<&Path>,
    key: &BdeKey,
    index: Option<usize>,
) -> BdeResult<()> {
    let indices = match index {
        Some(i) => {
            check_index(i)?;
            i..i + 1
        }
        None => 0..MAXKEYS,
    };

    let mut table = KeyLocTable::load(provider, lock_file)?;
    let zeros = vec![0u8; key.sectorsize as usize];
    for i in indices {
        provider
            .write_at(key.lsector[i], &zeros)
            .map_err(|e| BdeError::sector_io(key.lsector[i], &e))?;
        rand::thread_rng().fill_bytes(&mut table.slots[i]);
        tracing::warn!(index = i, "lock copy destroyed");
    }
    table.store(provider, lock_file)?;
    provider.flush()?;
    Ok(())
}

fn check_index(index: usize) -> BdeResult<()> {
    if index >= MAXKEYS {
        return Err(BdeError::Config(format!(
            "lock index {index} out of range (0..{MAXKEYS})"
        )));
    }
    Ok(())
}

fn new_key(provider: &dyn BlockProvider, opts: &FormatOptions) -> BdeResult<BdeKey> {
    let sectorsize = provider.sector_size();
    if !sectorsize.is_power_of_two() || (sectorsize as usize) < LOCKSIZE.max(512) {
        return Err(BdeError::Format(format!(
            "sector size {sectorsize} is not a power of two >= 512"
        )));
    }
    let ss = sectorsize as u64;
    let kps = (ss / gbde_crypto::SKEY_LEN as u64) as u32;
    let zone_cont = if opts.zone_cont == 0 { kps } else { opts.zone_cont };

    let sector0 = if opts.reserve_sector0 { ss } else { 0 };
    let media = provider.media_size();
    let sector_n = media - media % ss;
    let sectors = sector_n.saturating_sub(sector0) / ss;
    if sectors <= MAXKEYS as u64 + zone_cont as u64 {
        return Err(BdeError::Format(format!(
            "device of {media} bytes too small for one zone of {zone_cont} sectors"
        )));
    }

    let mut rng = rand::thread_rng();
    let media_sectors = sectors - MAXKEYS as u64;
    let mut lsector = [0u64; MAXKEYS];
    for (slot, idx) in lsector
        .iter_mut()
        .zip(rand::seq::index::sample(&mut rng, sectors as usize, MAXKEYS).into_iter())
    {
        *slot = sector0 + idx as u64 * ss;
    }
    lsector.sort_unstable();

    let mut key = BdeKey {
        sector0,
        sector_n,
        keyoffset: rng.gen_range(0..media_sectors) * ss,
        lsector,
        sectorsize,
        flags: if opts.reserve_sector0 { FLAG_SECT0 } else { 0 },
        zone_cont,
        spare: [0; 28],
        salt: [0; SALT_LEN],
        mkey: [0; MKEY_LEN],
    };
    rng.fill_bytes(&mut key.spare);
    rng.fill_bytes(&mut key.salt);
    rng.fill_bytes(&mut key.mkey);
    key.validate()?;
    Ok(key)
}

/// Encrypt lock copy `index` into its sector and record its slot in `table`.
fn write_lock_copy(
    provider: &dyn BlockProvider,
    table: &mut KeyLocTable,
    keymat: &KeyMaterial,
    key: &BdeKey,
    index: usize,
) -> BdeResult<()> {
    let lsector = key.lsector[index];
    let (slot, lk) = keyloc_encrypt(keymat, index, lsector);

    let mut sector = Zeroizing::new(vec![0u8; key.sectorsize as usize]);
    rand::thread_rng().fill_bytes(&mut sector[LOCKSIZE..]);
    sector[..LOCKSIZE].copy_from_slice(&encode_lock(key)[..]);
    Aes128Ctr.encrypt(&lk.key, &lk.iv, &mut sector[..LOCKSIZE]);

    provider
        .write_at(lsector, &sector)
        .map_err(|e| BdeError::sector_io(lsector, &e))?;
    table.slots[index] = slot;
    tracing::debug!(index, lsector, "lock copy written");
    Ok(())
}
