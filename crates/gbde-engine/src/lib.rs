//! gbde-engine: transparent sector encryption over a backing block device
//!
//! A [`Device`] owns a dedicated worker task. Every request is split into
//! per-zone work items; the worker fetches the data and key sectors each item
//! needs through the sector cache, applies the sector crypto, writes modified
//! sectors back, and completes the request. Backing I/O runs on the blocking
//! pool, so many reads and writes can be outstanding while all cache and work
//! bookkeeping stays on the one worker.

pub mod bio;
mod cache;
pub mod device;
mod work;
mod worker;

pub use bio::{Bio, BioCompletion};
pub use device::{Device, DeviceInfo};
