//! Public handle of an open encrypted device.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gbde_core::config::CacheConfig;
use gbde_core::{BdeError, BdeResult, DeviceStats};
use gbde_crypto::{Aes128Ctr, KdfParams, SectorCipher};
use gbde_lock::{decrypt_lock, max_sector, BdeKey, FormatOptions, KeyLocTable};
use gbde_storage::BlockProvider;
use secrecy::SecretString;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bio::{Bio, BioCompletion};
use crate::worker::{Event, Shared, Worker, WorkerConfig};

/// Geometry of the plaintext address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub sector_size: u32,
    /// Addressable logical sectors
    pub sectors: u64,
    /// Payload sectors per zone
    pub zone_cont: u32,
    /// Lock copy the device was opened with, if it was opened from disk
    pub lock_index: Option<usize>,
}

impl DeviceInfo {
    /// Size of the plaintext address space in bytes.
    pub fn size(&self) -> u64 {
        self.sectors * self.sector_size as u64
    }
}

/// An encrypted device: plaintext requests in, ciphertext on the provider.
///
/// Must be created inside a Tokio runtime; it spawns its worker task there.
pub struct Device {
    events: mpsc::UnboundedSender<Event>,
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
    info: DeviceInfo,
}

impl Device {
    /// Format `provider` under `secret` and start serving it.
    pub fn format(
        provider: Arc<dyn BlockProvider>,
        lock_file: Option<&Path>,
        secret: &SecretString,
        kdf: &KdfParams,
        opts: &FormatOptions,
        cache: &CacheConfig,
    ) -> BdeResult<Self> {
        let key = gbde_lock::format(provider.as_ref(), lock_file, secret, kdf, opts)?;
        Ok(Self::spawn(provider, key, None, cache, Arc::new(Aes128Ctr)))
    }

    /// Recover the key with `secret` and start serving the device.
    ///
    /// Fails with [`BdeError::KeyNotFound`] if no lock copy verifies.
    pub fn open(
        provider: Arc<dyn BlockProvider>,
        lock_file: Option<&Path>,
        secret: &SecretString,
        kdf: &KdfParams,
        cache: &CacheConfig,
    ) -> BdeResult<Self> {
        let table = KeyLocTable::load(provider.as_ref(), lock_file)?;
        let (key, index) = decrypt_lock(provider.as_ref(), &table, secret, kdf)?;
        Ok(Self::spawn(provider, key, Some(index), cache, Arc::new(Aes128Ctr)))
    }

    /// Serve a device whose key is already known.
    pub fn start(provider: Arc<dyn BlockProvider>, key: BdeKey, cache: &CacheConfig) -> Self {
        Self::spawn(provider, key, None, cache, Arc::new(Aes128Ctr))
    }

    /// As [`Device::start`], with a different payload cipher.
    pub fn start_with_cipher(
        provider: Arc<dyn BlockProvider>,
        key: BdeKey,
        cache: &CacheConfig,
        cipher: Arc<dyn SectorCipher>,
    ) -> Self {
        Self::spawn(provider, key, None, cache, cipher)
    }

    fn spawn(
        provider: Arc<dyn BlockProvider>,
        key: BdeKey,
        lock_index: Option<usize>,
        cache: &CacheConfig,
        cipher: Arc<dyn SectorCipher>,
    ) -> Self {
        let info = DeviceInfo {
            sector_size: key.sectorsize,
            sectors: max_sector(&key),
            zone_cont: key.zone_cont,
            lock_index,
        };
        let cfg = WorkerConfig {
            max_sectors: cache.max_sectors,
            max_idle: Duration::from_secs(cache.max_idle_secs),
            purge_interval: Duration::from_secs(cache.purge_interval_secs.max(1)),
        };
        tracing::info!(
            sectors = info.sectors,
            sector_size = info.sector_size,
            zone_cont = info.zone_cont,
            cipher = cipher.name(),
            "device open"
        );

        let shared = Arc::new(Shared::default());
        let (events, rx) = mpsc::unbounded_channel();
        let worker = Worker::new(key, cipher, provider, Arc::clone(&shared), cfg);
        let worker = tokio::spawn(worker.run(rx));
        Device {
            events,
            shared,
            worker,
            info,
        }
    }

    pub fn info(&self) -> DeviceInfo {
        self.info
    }

    /// Queue a request. The receiver resolves once every sector of it is
    /// done, or with the first error any part of it hit.
    pub fn submit(&self, bio: Bio) -> BioCompletion {
        let (tx, rx) = oneshot::channel();
        if self.shared.is_dead() {
            let _ = tx.send(Err(BdeError::Gone));
            return rx;
        }
        if let Err(mpsc::error::SendError(Event::Bio(_, tx))) =
            self.events.send(Event::Bio(bio, tx))
        {
            let _ = tx.send(Err(BdeError::Gone));
        }
        rx
    }

    async fn complete(&self, bio: Bio) -> BdeResult<Bio> {
        self.submit(bio).await.map_err(|_| BdeError::Gone)?
    }

    /// Read `length` bytes of plaintext at `offset`.
    pub async fn read(&self, offset: u64, length: u64) -> BdeResult<Vec<u8>> {
        Ok(self.complete(Bio::read(offset, length)).await?.data)
    }

    /// Encrypt and write `data` at `offset`.
    pub async fn write(&self, offset: u64, data: Vec<u8>) -> BdeResult<()> {
        self.complete(Bio::write(offset, data)).await.map(|_| ())
    }

    /// Crypto-erase `length` bytes at `offset`: their keys are replaced with
    /// random bytes and the old contents can never be decrypted again.
    pub async fn delete(&self, offset: u64, length: u64) -> BdeResult<()> {
        self.complete(Bio::delete(offset, length)).await.map(|_| ())
    }

    pub async fn stats(&self) -> BdeResult<DeviceStats> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Stats(tx))
            .map_err(|_| BdeError::Gone)?;
        rx.await.map_err(|_| BdeError::Gone)
    }

    /// Declare the backing device gone. Requests not yet started fail with
    /// [`BdeError::Gone`]; those already waiting on I/O run to completion.
    pub fn orphan(&self) {
        tracing::warn!("device orphaned");
        self.shared.mark_dead();
        let _ = self.events.send(Event::Orphan);
    }

    /// Drain outstanding work, flush the provider, and zero the key.
    pub async fn close(self) -> BdeResult<()> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(Event::Close(tx))
            .map_err(|_| BdeError::Gone)?;
        let result = rx.await.map_err(|_| BdeError::Gone)?;
        self.worker
            .await
            .map_err(|e| BdeError::Other(anyhow::anyhow!("device worker failed: {e}")))?;
        result
    }
}
