//! The key/zone map recovered from a lock record.

use gbde_core::{BdeError, BdeResult};
use gbde_crypto::{MKEY_LEN, SALT_LEN, SKEY_LEN};
use zeroize::Zeroize;

/// Number of redundant lock copies.
pub const MAXKEYS: usize = 4;

/// Size of an encoded lock record.
pub const LOCKSIZE: usize = 384;

/// Physical sector 0 holds the key-location table.
pub const FLAG_SECT0: u32 = 1;

/// Zone geometry, lock-copy locations, and master key of one device.
///
/// Byte offsets are physical. The master key is zeroed on drop.
#[derive(Clone, PartialEq, Eq, Zeroize)]
pub struct BdeKey {
    /// First byte of the region used for payload, key, and lock sectors
    pub sector0: u64,
    /// End of that region (exclusive)
    pub sector_n: u64,
    /// Rotation applied to media offsets before placement
    pub keyoffset: u64,
    /// Sectors holding the encrypted lock copies, ascending
    pub lsector: [u64; MAXKEYS],
    pub sectorsize: u32,
    pub flags: u32,
    /// Payload sectors per zone
    pub zone_cont: u32,
    pub spare: [u8; 28],
    pub salt: [u8; SALT_LEN],
    pub mkey: [u8; MKEY_LEN],
}

impl BdeKey {
    /// Per-sector keys that fit in one key sector.
    pub fn keys_per_sector(&self) -> u64 {
        self.sectorsize as u64 / SKEY_LEN as u64
    }

    /// Physical sectors per zone: the payload sectors plus the key sector.
    pub fn zone_width(&self) -> u64 {
        self.zone_cont as u64 + 1
    }

    /// Bytes available for zones once the lock sectors are set aside.
    pub fn media_width(&self) -> u64 {
        self.sector_n - self.sector0 - MAXKEYS as u64 * self.sectorsize as u64
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Check the invariants every decoded or freshly formatted key must hold.
    pub fn validate(&self) -> BdeResult<()> {
        let ss = self.sectorsize as u64;
        if !self.sectorsize.is_power_of_two() || self.sectorsize < 512 {
            return Err(format_err(format!(
                "sector size {} is not a power of two >= 512",
                self.sectorsize
            )));
        }
        if self.zone_cont == 0 || self.zone_cont as u64 > self.keys_per_sector() {
            return Err(format_err(format!(
                "zone_cont {} outside 1..={}",
                self.zone_cont,
                self.keys_per_sector()
            )));
        }
        if self.sector0 % ss != 0 || self.sector_n % ss != 0 || self.keyoffset % ss != 0 {
            return Err(format_err("unaligned sector range or key offset"));
        }
        if self.has_flag(FLAG_SECT0) && self.sector0 < ss {
            return Err(format_err("sector 0 reserved but sector0 is 0"));
        }

        let reserved = MAXKEYS as u64 * ss;
        let span = self
            .sector_n
            .checked_sub(self.sector0)
            .filter(|span| *span > reserved)
            .ok_or_else(|| format_err("sector range too small for lock copies"))?;
        let media_width = span - reserved;
        if self.keyoffset >= media_width {
            return Err(format_err(format!(
                "key offset {} beyond media width {media_width}",
                self.keyoffset
            )));
        }
        if media_width < self.zone_width() * ss {
            return Err(format_err("media holds no complete zone"));
        }

        let mut prev: Option<u64> = None;
        for &l in &self.lsector {
            if l % ss != 0 || l < self.sector0 || l >= self.sector_n {
                return Err(format_err(format!("lock sector {l} out of range")));
            }
            if prev.is_some_and(|p| p >= l) {
                return Err(format_err("lock sectors not strictly ascending"));
            }
            prev = Some(l);
        }

        if self.mkey.iter().all(|b| *b == 0) {
            return Err(format_err("master key destroyed"));
        }
        Ok(())
    }
}

fn format_err(msg: impl Into<String>) -> BdeError {
    BdeError::Format(msg.into())
}

impl Drop for BdeKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl std::fmt::Debug for BdeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BdeKey")
            .field("sector0", &self.sector0)
            .field("sector_n", &self.sector_n)
            .field("keyoffset", &self.keyoffset)
            .field("lsector", &self.lsector)
            .field("sectorsize", &self.sectorsize)
            .field("flags", &self.flags)
            .field("zone_cont", &self.zone_cont)
            .field("mkey", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A valid 512-byte-sector key over a 1 MiB device.
    pub(crate) fn sample_key() -> BdeKey {
        BdeKey {
            sector0: 512,
            sector_n: 1024 * 1024,
            keyoffset: 7 * 512,
            lsector: [1024, 40 * 512, 900 * 512, 2000 * 512],
            sectorsize: 512,
            flags: FLAG_SECT0,
            zone_cont: 16,
            spare: [9; 28],
            salt: [3; SALT_LEN],
            mkey: [0x42; MKEY_LEN],
        }
    }

    #[test]
    fn sample_key_is_valid() {
        let key = sample_key();
        key.validate().unwrap();
        assert_eq!(key.keys_per_sector(), 32);
        assert_eq!(key.zone_width(), 17);
        assert_eq!(key.media_width(), 1024 * 1024 - 512 - 4 * 512);
    }

    #[test]
    fn rejects_bad_sector_size() {
        let mut key = sample_key();
        key.sectorsize = 768;
        assert!(matches!(key.validate(), Err(BdeError::Format(_))));
        key.sectorsize = 256;
        assert!(key.validate().is_err());
    }

    #[test]
    fn rejects_zone_cont_out_of_range() {
        let mut key = sample_key();
        key.zone_cont = 0;
        assert!(key.validate().is_err());
        key.zone_cont = 33;
        assert!(key.validate().is_err());
        key.zone_cont = 32;
        assert!(key.validate().is_ok());
    }

    #[test]
    fn rejects_unsorted_or_duplicate_lock_sectors() {
        let mut key = sample_key();
        key.lsector.swap(1, 2);
        assert!(key.validate().is_err());
        let mut key = sample_key();
        key.lsector[1] = key.lsector[0];
        assert!(key.validate().is_err());
    }

    #[test]
    fn rejects_lock_sector_outside_range() {
        let mut key = sample_key();
        key.lsector[0] = 0;
        assert!(key.validate().is_err());
        let mut key = sample_key();
        key.lsector[3] = key.sector_n;
        assert!(key.validate().is_err());
    }

    #[test]
    fn rejects_destroyed_master_key() {
        let mut key = sample_key();
        key.mkey = [0; MKEY_LEN];
        assert!(key.validate().is_err());
    }

    #[test]
    fn rejects_range_without_room_for_a_zone() {
        let mut key = sample_key();
        key.sector_n = key.sector0 + 4 * 512 + 10 * 512;
        key.lsector = [512, 1024, 1536, 2048];
        key.keyoffset = 0;
        assert!(key.validate().is_err());
    }

    #[test]
    fn debug_redacts_master_key() {
        let s = format!("{:?}", sample_key());
        assert!(s.contains("[REDACTED]"));
        assert!(!s.contains("66, 66"));
    }
}
