//! gbde-lock: the key/zone map of an encrypted device and its on-disk lock
//!
//! A device is opened by reading the key-location table, deriving key
//! material from the passphrase, and trying each of the [`MAXKEYS`]
//! obfuscated lock copies until one decrypts and verifies.

pub mod admin;
pub mod codec;
pub mod key;
pub mod keyloc;
pub mod unlock;
pub mod zone;

pub use admin::{format, nuke, set_key, FormatOptions};
pub use codec::{decode_lock, encode_lock};
pub use key::{BdeKey, FLAG_SECT0, LOCKSIZE, MAXKEYS};
pub use keyloc::{keyloc_decrypt, keyloc_encrypt, KeyLocTable, LockCipherKey};
pub use unlock::decrypt_lock;
pub use zone::{map_sector, max_sector, SectorMap};
