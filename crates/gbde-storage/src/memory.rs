//! In-memory block device, used by tests and benchmarks.

use std::io;
use std::sync::Mutex;

use crate::provider::{check_range, BlockProvider};

pub struct MemDevice {
    data: Mutex<Vec<u8>>,
    sector_size: u32,
}

impl MemDevice {
    /// A zero-filled device of `size` bytes.
    pub fn new(size: u64, sector_size: u32) -> Self {
        MemDevice {
            data: Mutex::new(vec![0u8; size as usize]),
            sector_size,
        }
    }

    /// Copy of the raw media contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Overwrite raw bytes, bypassing any encryption layer above.
    pub fn poke(&self, offset: u64, bytes: &[u8]) {
        let mut data = self.lock();
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        // A panicking writer leaves bytes, not invariants, behind.
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BlockProvider for MemDevice {
    fn media_size(&self) -> u64 {
        self.lock().len() as u64
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.lock();
        check_range(data.len() as u64, offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut data = self.lock();
        check_range(data.len() as u64, offset, buf.len())?;
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read() {
        let dev = MemDevice::new(8192, 512);
        dev.write_at(512, &[0xAB; 512]).unwrap();
        let mut buf = [0u8; 512];
        dev.read_at(512, &mut buf).unwrap();
        assert_eq!(buf, [0xAB; 512]);
    }

    #[test]
    fn read_past_end_fails() {
        let dev = MemDevice::new(1024, 512);
        let mut buf = [0u8; 512];
        assert!(dev.read_at(1024, &mut buf).is_err());
    }

    #[test]
    fn poke_is_visible_in_snapshot() {
        let dev = MemDevice::new(1024, 512);
        dev.poke(10, &[1, 2, 3]);
        assert_eq!(&dev.snapshot()[10..13], &[1, 2, 3]);
        assert_eq!(dev.media_size(), 1024);
    }
}
