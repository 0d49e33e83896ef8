use serde::{Deserialize, Serialize};

/// Direction of a block I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BioCmd {
    /// Decrypt sectors into the request buffer
    Read,
    /// Encrypt the request buffer onto the media
    Write,
    /// Crypto-erase: destroy the per-sector keys of the range
    Delete,
}

impl BioCmd {
    /// True for commands that modify on-disk state.
    pub fn mutates(self) -> bool {
        !matches!(self, BioCmd::Read)
    }
}

/// Point-in-time counters reported by an open device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Work items not yet finished
    pub work_live: usize,
    /// Sector cache entries ever allocated
    pub sectors: usize,
    /// Entries on the free list (VALID, unreferenced)
    pub sectors_free: usize,
    /// Lookups satisfied by an existing VALID or IO entry
    pub cache_hits: u64,
    /// Reads issued against the backing device
    pub backing_reads: u64,
    /// Writes issued against the backing device
    pub backing_writes: u64,
}
