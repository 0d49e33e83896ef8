//! Backing block device interface

use std::io;
use std::sync::Arc;

/// A physical block device addressed in bytes.
///
/// Calls may block; the engine runs them off its worker so many reads and
/// writes can be in flight at once. Implementations must be safe to call
/// concurrently for disjoint ranges.
pub trait BlockProvider: Send + Sync + 'static {
    /// Usable size in bytes.
    fn media_size(&self) -> u64;

    /// Physical sector size in bytes.
    fn sector_size(&self) -> u32;

    /// Fill `buf` from `offset`. Short media is an `UnexpectedEof` error.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write all of `buf` at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: BlockProvider + ?Sized> BlockProvider for Arc<T> {
    fn media_size(&self) -> u64 {
        (**self).media_size()
    }

    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        (**self).write_at(offset, buf)
    }

    fn flush(&self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Reject accesses that run past the end of the media.
pub fn check_range(media_size: u64, offset: u64, len: usize) -> io::Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= media_size => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("access at {offset}+{len} beyond media size {media_size}"),
        )),
    }
}
