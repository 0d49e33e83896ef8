//! Geometry: logical sector numbers to physical data and key sectors.
//!
//! Media offsets are laid out zone by zone, `zone_cont` payload sectors then
//! one key sector. The whole layout is rotated by `keyoffset` within the media
//! width, shifted to `sector0`, and finally moved past the lock-copy sectors,
//! which are therefore never handed out as data or key sectors.

use gbde_crypto::SKEY_LEN;

use crate::key::BdeKey;

/// Physical placement of one logical sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorMap {
    /// Physical byte offset of the ciphertext
    pub data: u64,
    /// Physical byte offset of the zone's key sector
    pub key: u64,
    /// Byte offset of this sector's key inside the key sector
    pub slot: usize,
}

/// Number of addressable logical sectors. Only complete zones count.
pub fn max_sector(key: &BdeKey) -> u64 {
    let zone_bytes = key.zone_width() * key.sectorsize as u64;
    (key.media_width() / zone_bytes) * key.zone_cont as u64
}

/// Map logical sector `sector` (in `0..max_sector(key)`) to its placement.
pub fn map_sector(key: &BdeKey, sector: u64) -> SectorMap {
    debug_assert!(sector < max_sector(key), "sector {sector} beyond max");

    let ss = key.sectorsize as u64;
    let zone_cont = key.zone_cont as u64;
    let zone = sector / zone_cont;
    let zoff = sector % zone_cont;
    let zone_base = zone * key.zone_width();

    SectorMap {
        data: place(key, (zone_base + zoff) * ss),
        key: place(key, (zone_base + zone_cont) * ss),
        slot: zoff as usize * SKEY_LEN,
    }
}

/// Zone index of a logical sector; sectors of one zone share a key sector.
pub fn zone_of(key: &BdeKey, sector: u64) -> u64 {
    sector / key.zone_cont as u64
}

fn place(key: &BdeKey, media: u64) -> u64 {
    let mut phys = key.sector0 + (media + key.keyoffset) % key.media_width();
    for &l in &key.lsector {
        if l <= phys {
            phys += key.sectorsize as u64;
        }
    }
    phys
}
