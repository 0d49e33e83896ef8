//! gbde-storage: the backing block device seen by the encryption layer

pub mod file;
pub mod memory;
pub mod provider;

pub use file::FileDevice;
pub use memory::MemDevice;
pub use provider::{check_range, BlockProvider};
