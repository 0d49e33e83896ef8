//! Lock record (de)serialization.
//!
//! ```text
//! off  len  field
//!   0    8  sector0
//!   8    8  sector_n
//!  16    8  keyoffset
//!  24   32  lsector[4]
//!  56    4  sectorsize
//!  60    4  flags
//!  64    4  zone_cont
//!  68   28  spare
//!  96   16  salt
//! 112  256  mkey
//! 368   16  hash
//! ```
//!
//! All integers little-endian. `hash` is the first 16 bytes of
//! SHA-256("gbde-lock-v1" || record with the hash zeroed).

use gbde_core::{BdeError, BdeResult};
use gbde_crypto::{MKEY_LEN, SALT_LEN};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::key::{BdeKey, LOCKSIZE, MAXKEYS};

const VERSION_TAG: &[u8] = b"gbde-lock-v1";
const HASH_OFF: usize = 368;
const HASH_LEN: usize = 16;

/// Serialize `key` into a lock record, computing its hash.
pub fn encode_lock(key: &BdeKey) -> Zeroizing<[u8; LOCKSIZE]> {
    let mut buf = Zeroizing::new([0u8; LOCKSIZE]);
    let mut w = Writer {
        buf: &mut buf[..],
        pos: 0,
    };
    w.u64(key.sector0);
    w.u64(key.sector_n);
    w.u64(key.keyoffset);
    for l in &key.lsector {
        w.u64(*l);
    }
    w.u32(key.sectorsize);
    w.u32(key.flags);
    w.u32(key.zone_cont);
    w.bytes(&key.spare);
    w.bytes(&key.salt);
    w.bytes(&key.mkey);
    debug_assert_eq!(w.pos, HASH_OFF);

    let hash = record_hash(&buf[..]);
    buf[HASH_OFF..].copy_from_slice(&hash);
    buf
}

/// Parse and verify a lock record.
///
/// Fails with `Format` if the hash does not match or the decoded geometry
/// is not usable.
pub fn decode_lock(buf: &[u8]) -> BdeResult<BdeKey> {
    if buf.len() < LOCKSIZE {
        return Err(BdeError::Format(format!(
            "lock record is {} bytes, need {LOCKSIZE}",
            buf.len()
        )));
    }
    let buf = &buf[..LOCKSIZE];
    let expected = record_hash(buf);
    if !constant_time_eq(&expected, &buf[HASH_OFF..]) {
        return Err(BdeError::Format("lock hash mismatch".into()));
    }

    let mut r = Reader { buf, pos: 0 };
    let sector0 = r.u64();
    let sector_n = r.u64();
    let keyoffset = r.u64();
    let mut lsector = [0u64; MAXKEYS];
    for l in lsector.iter_mut() {
        *l = r.u64();
    }
    let sectorsize = r.u32();
    let flags = r.u32();
    let zone_cont = r.u32();
    let mut key = BdeKey {
        sector0,
        sector_n,
        keyoffset,
        lsector,
        sectorsize,
        flags,
        zone_cont,
        spare: [0; 28],
        salt: [0; SALT_LEN],
        mkey: [0; MKEY_LEN],
    };
    r.bytes(&mut key.spare);
    r.bytes(&mut key.salt);
    r.bytes(&mut key.mkey);

    key.validate()?;
    Ok(key)
}

fn record_hash(record: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(VERSION_TAG);
    hasher.update(&record[..HASH_OFF]);
    hasher.update([0u8; HASH_LEN]);
    let digest = hasher.finalize();
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest[..HASH_LEN]);
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn bytes(&mut self, b: &[u8]) {
        self.buf[self.pos..self.pos + b.len()].copy_from_slice(b);
        self.pos += b.len();
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn bytes(&mut self, out: &mut [u8]) {
        out.copy_from_slice(&self.buf[self.pos..self.pos + out.len()]);
        self.pos += out.len();
    }

    fn u64(&mut self) -> u64 {
        let mut b = [0u8; 8];
        self.bytes(&mut b);
        u64::from_le_bytes(b)
    }

    fn u32(&mut self) -> u32 {
        let mut b = [0u8; 4];
        self.bytes(&mut b);
        u32::from_le_bytes(b)
    }
}
