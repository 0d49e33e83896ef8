//! Shared fixtures: a backing device with injectable faults and delays.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gbde_core::config::CacheConfig;
use gbde_crypto::KdfParams;
use gbde_engine::Device;
use gbde_lock::{BdeKey, FormatOptions};
use gbde_storage::{BlockProvider, MemDevice};
use secrecy::SecretString;

pub const SS: u64 = 512;

pub struct FaultyDevice {
    inner: MemDevice,
    read_faults: Mutex<HashMap<u64, io::ErrorKind>>,
    write_faults: Mutex<HashMap<u64, io::ErrorKind>>,
    read_delays: Mutex<HashMap<u64, Duration>>,
    write_delays: Mutex<HashMap<u64, Duration>>,
    disconnected: AtomicBool,
}

impl FaultyDevice {
    pub fn new(size: u64) -> Self {
        FaultyDevice {
            inner: MemDevice::new(size, SS as u32),
            read_faults: Mutex::new(HashMap::new()),
            write_faults: Mutex::new(HashMap::new()),
            read_delays: Mutex::new(HashMap::new()),
            write_delays: Mutex::new(HashMap::new()),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn fail_reads_at(&self, offset: u64) {
        self.read_faults
            .lock()
            .unwrap()
            .insert(offset, io::ErrorKind::Other);
    }

    pub fn fail_writes_at(&self, offset: u64) {
        self.write_faults
            .lock()
            .unwrap()
            .insert(offset, io::ErrorKind::Other);
    }

    pub fn delay_reads_at(&self, offset: u64, delay: Duration) {
        self.read_delays.lock().unwrap().insert(offset, delay);
    }

    pub fn delay_writes_at(&self, offset: u64, delay: Duration) {
        self.write_delays.lock().unwrap().insert(offset, delay);
    }

    pub fn clear_faults(&self) {
        self.read_faults.lock().unwrap().clear();
        self.write_faults.lock().unwrap().clear();
        self.read_delays.lock().unwrap().clear();
        self.write_delays.lock().unwrap().clear();
    }

    /// Every later access fails as if the device was unplugged.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn raw(&self) -> &MemDevice {
        &self.inner
    }

    pub fn raw_sector(&self, offset: u64) -> Vec<u8> {
        let mut buf = vec![0u8; SS as usize];
        self.inner.read_at(offset, &mut buf).unwrap();
        buf
    }

    fn check(&self, offset: u64, faults: &Mutex<HashMap<u64, io::ErrorKind>>) -> io::Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device unplugged"));
        }
        match faults.lock().unwrap().get(&offset) {
            Some(kind) => Err(io::Error::new(*kind, format!("injected fault at {offset}"))),
            None => Ok(()),
        }
    }
}

impl BlockProvider for FaultyDevice {
    fn media_size(&self) -> u64 {
        self.inner.media_size()
    }

    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let delay = self.read_delays.lock().unwrap().get(&offset).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.check(offset, &self.read_faults)?;
        self.inner.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let delay = self.write_delays.lock().unwrap().get(&offset).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.check(offset, &self.write_faults)?;
        self.inner.write_at(offset, buf)
    }
}

pub fn fast_kdf() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

pub fn cache_cfg() -> CacheConfig {
    CacheConfig {
        max_sectors: 256,
        max_idle_secs: 300,
        purge_interval_secs: 10,
    }
}

pub fn zone16() -> FormatOptions {
    FormatOptions {
        zone_cont: 16,
        reserve_sector0: true,
    }
}

/// A formatted 1 MiB device (16 sectors per zone) and its key.
pub fn formatted(secret: &str) -> (Arc<FaultyDevice>, BdeKey) {
    let dev = Arc::new(FaultyDevice::new(1024 * 1024));
    let key = gbde_lock::format(
        dev.as_ref(),
        None,
        &SecretString::from(secret),
        &fast_kdf(),
        &zone16(),
    )
    .unwrap();
    (dev, key)
}

/// Serve `dev` with `key` on a fresh worker (empty cache).
pub fn serve(dev: &Arc<FaultyDevice>, key: &BdeKey) -> Device {
    Device::start(dev.clone(), key.clone(), &cache_cfg())
}

pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i % 251) as u8))
        .collect()
}
