//! File-backed block device (image files and device nodes).

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use crate::provider::{check_range, BlockProvider};

pub struct FileDevice {
    file: File,
    media_size: u64,
    sector_size: u32,
}

impl FileDevice {
    /// Open an existing image or device node.
    ///
    /// The media size is the file length rounded down to whole sectors.
    pub fn open(path: &Path, sector_size: u32, read_only: bool) -> Result<Self> {
        check_sector_size(sector_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .with_context(|| format!("opening backing device: {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("stat backing device: {}", path.display()))?
            .len();
        let media_size = len - len % sector_size as u64;
        tracing::debug!(path = %path.display(), media_size, sector_size, "backing device opened");
        Ok(FileDevice {
            file,
            media_size,
            sector_size,
        })
    }

    /// Create (or truncate) a sparse image file of `size` bytes.
    pub fn create(path: &Path, size: u64, sector_size: u32) -> Result<Self> {
        check_sector_size(sector_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("creating image: {}", path.display()))?;
        file.set_len(size)
            .with_context(|| format!("sizing image: {}", path.display()))?;
        Ok(FileDevice {
            file,
            media_size: size - size % sector_size as u64,
            sector_size,
        })
    }
}

fn check_sector_size(sector_size: u32) -> Result<()> {
    if !sector_size.is_power_of_two() || sector_size < 512 {
        anyhow::bail!("sector size {sector_size} is not a power of two of at least 512");
    }
    Ok(())
}

impl BlockProvider for FileDevice {
    fn media_size(&self) -> u64 {
        self.media_size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(self.media_size, offset, buf.len())?;
        read_exact_at(&self.file, offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        check_range(self.media_size, offset, buf.len())?;
        write_all_at(&self.file, offset, buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_reopen_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let dev = FileDevice::create(&path, 64 * 1024, 512).unwrap();
        assert_eq!(dev.media_size(), 64 * 1024);
        dev.write_at(4096, &[0x5A; 512]).unwrap();
        dev.flush().unwrap();
        drop(dev);

        let dev = FileDevice::open(&path, 512, true).unwrap();
        let mut buf = [0u8; 512];
        dev.read_at(4096, &mut buf).unwrap();
        assert_eq!(buf, [0x5A; 512]);
    }

    #[test]
    fn media_size_rounds_down_to_sectors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.img");
        std::fs::write(&path, vec![0u8; 1300]).unwrap();

        let dev = FileDevice::open(&path, 512, false).unwrap();
        assert_eq!(dev.media_size(), 1024);
        let mut buf = [0u8; 512];
        assert!(dev.read_at(1024, &mut buf).is_err());
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileDevice::open(&dir.path().join("nope.img"), 512, false).is_err());
    }

    #[test]
    fn rejects_bad_sector_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        for bad in [0, 256, 768] {
            let err = FileDevice::open(&path, bad, true).err().unwrap();
            assert!(err.to_string().contains("sector size"), "{err}");
            assert!(FileDevice::create(&dir.path().join("new.img"), 4096, bad).is_err());
        }
        assert!(!dir.path().join("new.img").exists());
        assert!(FileDevice::open(&path, 4096, true).is_ok());
    }
}
