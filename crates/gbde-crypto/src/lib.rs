//! gbde-crypto: cryptographic primitives for sector-granular disk encryption
//!
//! Key hierarchy:
//! ```text
//! Passphrase ──Argon2id──▶ key material (512-bit)
//!   └── ARC4 stream (seeded per lock slot): obfuscates lock locations, keys the lock record
//! Lock record
//!   └── Master key (2048-bit random)
//!       └── Key-key per sector (HKDF-SHA256, info = "gbde-kkey" || offset)
//!           └── Sector key (128-bit random per write, stored AES-wrapped in the zone key sector)
//!               └── Payload: AES-128-CTR, IV = offset
//! ```

pub mod arc4;
pub mod cipher;
pub mod kdf;
pub mod keys;
pub mod sector;

pub use arc4::Arc4;
pub use cipher::{Aes128Ctr, SectorCipher};
pub use kdf::{derive_keymat, KdfParams, KeyMaterial};
pub use keys::{derive_kkey, generate_sector_key, unwrap_sector_key, wrap_sector_key, SectorKey};
pub use sector::SectorCrypter;

/// Length of a per-sector key (AES-128)
pub const SKEY_LEN: usize = 16;

/// Length of the master key stored in the lock
pub const MKEY_LEN: usize = 256;

/// Length of the passphrase-derived key material
pub const KEYMAT_LEN: usize = 64;

/// Length of lock and KDF salts
pub const SALT_LEN: usize = 16;

/// Length of a payload cipher IV
pub const IV_LEN: usize = 16;
