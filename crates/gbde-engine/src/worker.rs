//! The per-device worker task.
//!
//! The worker exclusively owns the sector cache, the work items, and the
//! requests they belong to. Requests and control messages arrive on one
//! channel, backing I/O completions on another; both only ever run on this
//! task, so none of the bookkeeping needs a lock. Backing reads and writes
//! run on the blocking pool and may overlap freely.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gbde_core::{BdeError, BdeResult, BioCmd, DeviceStats};
use gbde_crypto::{SectorCipher, SectorCrypter, SKEY_LEN};
use gbde_lock::{map_sector, max_sector, BdeKey};
use gbde_storage::BlockProvider;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::bio::Bio;
use crate::cache::{Fetch, SectorCache, SectorId, SectorState};
use crate::work::{split_by_zone, BioId, Work, WorkId, WorkState};

pub(crate) enum Event {
    Bio(Bio, oneshot::Sender<BdeResult<Bio>>),
    Stats(oneshot::Sender<DeviceStats>),
    Orphan,
    Close(oneshot::Sender<BdeResult<()>>),
}

enum IoDone {
    Read {
        id: SectorId,
        result: io::Result<Vec<u8>>,
    },
    Write {
        id: SectorId,
        gen: u64,
        result: io::Result<()>,
    },
}

/// State shared between the device handle and its worker.
#[derive(Default)]
pub(crate) struct Shared {
    /// Set once the backing device is gone; everything not yet started fails.
    pub dead: AtomicBool,
}

impl Shared {
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }
}

struct BioEntry {
    bio: Bio,
    remaining: usize,
    error: Option<BdeError>,
    done: oneshot::Sender<BdeResult<Bio>>,
}

pub(crate) struct WorkerConfig {
    pub max_sectors: usize,
    pub max_idle: Duration,
    pub purge_interval: Duration,
}

pub(crate) struct Worker {
    key: BdeKey,
    cipher: Arc<dyn SectorCipher>,
    provider: Arc<dyn BlockProvider>,
    shared: Arc<Shared>,
    cache: SectorCache,
    works: BTreeMap<WorkId, Work>,
    bios: HashMap<BioId, BioEntry>,
    ready: VecDeque<WorkId>,
    deferred: Vec<WorkId>,
    next_work: WorkId,
    next_bio: BioId,
    io_tx: mpsc::UnboundedSender<IoDone>,
    io_rx: mpsc::UnboundedReceiver<IoDone>,
    inflight: usize,
    backing_reads: u64,
    backing_writes: u64,
    max_sector: u64,
    max_idle: Duration,
    purge_interval: Duration,
    closing: Option<oneshot::Sender<BdeResult<()>>>,
}

impl Worker {
    pub fn new(
        key: BdeKey,
        cipher: Arc<dyn SectorCipher>,
        provider: Arc<dyn BlockProvider>,
        shared: Arc<Shared>,
        cfg: WorkerConfig,
    ) -> Self {
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let max_sector = max_sector(&key);
        let sector_size = key.sectorsize as usize;
        Worker {
            key,
            cipher,
            provider,
            shared,
            cache: SectorCache::new(sector_size, cfg.max_sectors),
            works: BTreeMap::new(),
            bios: HashMap::new(),
            ready: VecDeque::new(),
            deferred: Vec::new(),
            next_work: 0,
            next_bio: 0,
            io_tx,
            io_rx,
            inflight: 0,
            backing_reads: 0,
            backing_writes: 0,
            max_sector,
            max_idle: cfg.max_idle,
            purge_interval: cfg.purge_interval,
            closing: None,
        }
    }

    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        let mut purge = tokio::time::interval(self.purge_interval);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;
                Some(done) = self.io_rx.recv() => self.io_done(done),
                ev = events.recv(), if events_open && self.closing.is_none() => match ev {
                    Some(ev) => self.event(ev),
                    None => events_open = false,
                },
                _ = purge.tick() => {
                    let purged = self.cache.purge_idle(self.max_idle);
                    if purged > 0 {
                        debug!(purged, "idle sectors purged");
                    }
                }
            }

            while let Some(id) = self.ready.pop_front() {
                self.advance(id);
            }

            if self.works.is_empty() && self.inflight == 0 {
                if let Some(reply) = self.closing.take() {
                    self.shutdown(reply).await;
                    break;
                }
                if !events_open {
                    debug!("device handle dropped, worker exiting");
                    break;
                }
            }
        }
    }

    fn event(&mut self, ev: Event) {
        match ev {
            Event::Bio(bio, done) => self.start(bio, done),
            Event::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Event::Orphan => self.fail_queued(),
            Event::Close(reply) => {
                info!(works = self.works.len(), "closing device, draining");
                self.closing = Some(reply);
            }
        }
    }

    fn stats(&self) -> DeviceStats {
        DeviceStats {
            work_live: self.works.len(),
            sectors: self.cache.len(),
            sectors_free: self.cache.free_len(),
            cache_hits: self.cache.hits,
            backing_reads: self.backing_reads,
            backing_writes: self.backing_writes,
        }
    }

    /// Validate a request and queue one work item per zone it touches.
    fn start(&mut self, mut bio: Bio, done: oneshot::Sender<BdeResult<Bio>>) {
        if self.shared.is_dead() {
            let _ = done.send(Err(BdeError::Gone));
            return;
        }
        if let Err(e) = self.check(&bio) {
            debug!(offset = bio.offset, length = bio.length, error = %e, "request rejected");
            let _ = done.send(Err(e));
            return;
        }
        if bio.length == 0 {
            let _ = done.send(Ok(bio));
            return;
        }
        if bio.cmd == BioCmd::Read {
            bio.data = vec![0u8; bio.length as usize];
        }

        let ss = self.key.sectorsize as u64;
        let first = bio.offset / ss;
        let count = bio.length / ss;
        let runs = split_by_zone(self.key.zone_cont as u64, first, count);

        let bio_id = self.next_bio;
        self.next_bio += 1;
        for &(s, n) in &runs {
            let id = self.next_work;
            self.next_work += 1;
            let bio_off = ((s - first) * ss) as usize;
            self.works
                .insert(id, Work::new(bio_id, bio.cmd, s, n, bio_off));
            self.ready.push_back(id);
        }
        debug!(
            bio = bio_id,
            cmd = ?bio.cmd,
            offset = bio.offset,
            length = bio.length,
            works = runs.len(),
            "request queued"
        );
        self.bios.insert(
            bio_id,
            BioEntry {
                bio,
                remaining: runs.len(),
                error: None,
                done,
            },
        );
    }

    fn check(&self, bio: &Bio) -> BdeResult<()> {
        let ss = self.key.sectorsize;
        let misaligned = BdeError::Misaligned {
            offset: bio.offset,
            length: bio.length,
            sector_size: ss,
        };
        if bio.offset % ss as u64 != 0 || bio.length % ss as u64 != 0 {
            return Err(misaligned);
        }
        if bio.cmd == BioCmd::Write && bio.data.len() as u64 != bio.length {
            return Err(misaligned);
        }
        let limit = self.max_sector * ss as u64;
        match bio.offset.checked_add(bio.length) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(BdeError::OutOfRange {
                offset: bio.offset,
                length: bio.length,
                limit,
            }),
        }
    }

    /// Drive one work item as far as it can go without waiting.
    fn advance(&mut self, id: WorkId) {
        loop {
            let Some(state) = self.works.get(&id).map(|w| w.state) else {
                return;
            };
            let progressed = match state {
                WorkState::Setup => self.setup(id),
                WorkState::Wait => self.wait(id),
                WorkState::Writeback => self.writeback(id),
                WorkState::Finish => {
                    self.finish(id);
                    return;
                }
            };
            if !progressed {
                return;
            }
        }
    }

    fn setup(&mut self, id: WorkId) -> bool {
        let Some(work) = self.works.get(&id) else {
            return false;
        };
        if self.shared.is_dead() {
            self.fail(id, BdeError::Gone);
            return true;
        }
        if self
            .works
            .range(..id)
            .any(|(_, older)| older.conflicts_with(work))
        {
            debug!(work = id, first = work.first, "deferred behind overlapping work");
            if !self.deferred.contains(&id) {
                self.deferred.push(id);
            }
            return false;
        }

        let (cmd, first, count) = (work.cmd, work.first, work.count);
        let maps: Vec<_> = (first..first + count)
            .map(|s| map_sector(&self.key, s))
            .collect();

        let key_sector = self.acquire(maps[0].key, Fetch::Read);
        let data: Vec<SectorId> = match cmd {
            BioCmd::Read => maps.iter().map(|m| self.acquire(m.data, Fetch::Read)).collect(),
            BioCmd::Write => maps
                .iter()
                .map(|m| self.acquire(m.data, Fetch::Overwrite))
                .collect(),
            BioCmd::Delete => Vec::new(),
        };

        let Some(work) = self.works.get_mut(&id) else {
            return false;
        };
        work.maps = maps;
        work.key_sector = Some(key_sector);
        work.data = data;
        work.state = WorkState::Wait;
        true
    }

    fn acquire(&mut self, offset: u64, fetch: Fetch) -> SectorId {
        let (sid, needs_read) = self.cache.get(offset, fetch);
        if needs_read {
            self.issue_read(sid);
        }
        sid
    }

    fn wait(&mut self, id: WorkId) -> bool {
        let Some(work) = self.works.get(&id) else {
            return false;
        };
        let held: Vec<SectorId> = work.held().collect();

        let mut busy = Vec::new();
        for &sid in &held {
            let s = self.cache.sector(sid);
            if let Some(e) = &s.error {
                let err = e.duplicate();
                self.fail(id, err);
                return true;
            }
            if s.state == SectorState::Io {
                busy.push(sid);
            }
        }
        if !busy.is_empty() {
            for sid in busy {
                self.cache.add_waiter(sid, id);
            }
            return false;
        }

        if let Err(e) = self.crypt(id) {
            warn!(work = id, error = %e, "sector crypto failed");
            self.fail(id, e);
            return true;
        }

        let Some(work) = self.works.get_mut(&id) else {
            return false;
        };
        if work.cmd.mutates() {
            work.state = WorkState::Writeback;
            let mut targets: Vec<SectorId> = work.pending.iter().map(|(sid, _)| *sid).collect();
            targets.dedup();
            for sid in targets {
                self.issue_write(sid);
            }
        } else {
            work.state = WorkState::Finish;
        }
        true
    }

    /// Apply the sector crypto for a work whose sectors are all present.
    fn crypt(&mut self, id: WorkId) -> BdeResult<()> {
        let Some(work) = self.works.get_mut(&id) else {
            return Ok(());
        };
        let key_sid = work
            .key_sector
            .ok_or_else(|| BdeError::Other(anyhow::anyhow!("work {id} has no key sector")))?;
        let crypter = SectorCrypter::new(&self.key.mkey, &self.key.salt, self.cipher.as_ref());
        let ss = self.key.sectorsize as usize;

        match work.cmd {
            BioCmd::Read => {
                let entry = self
                    .bios
                    .get_mut(&work.bio)
                    .ok_or_else(|| BdeError::Other(anyhow::anyhow!("work {id} lost its request")))?;
                for (i, m) in work.maps.iter().enumerate() {
                    let logical = (work.first + i as u64) * ss as u64;
                    let start = work.bio_off + i * ss;
                    let out = &mut entry.bio.data[start..start + ss];
                    out.copy_from_slice(&self.cache.sector(work.data[i]).buf);
                    let slot = &self.cache.sector(key_sid).buf[m.slot..m.slot + SKEY_LEN];
                    crypter.decrypt(logical, slot, out)?;
                }
            }
            BioCmd::Write => {
                let entry = self
                    .bios
                    .get(&work.bio)
                    .ok_or_else(|| BdeError::Other(anyhow::anyhow!("work {id} lost its request")))?;
                for (i, m) in work.maps.iter().enumerate() {
                    let logical = (work.first + i as u64) * ss as u64;
                    let start = work.bio_off + i * ss;
                    let plain = &entry.bio.data[start..start + ss];
                    let mut slot = [0u8; SKEY_LEN];
                    crypter.encrypt(
                        logical,
                        &mut slot,
                        plain,
                        &mut self.cache.sector_mut(work.data[i]).buf,
                    )?;
                    self.cache.sector_mut(key_sid).buf[m.slot..m.slot + SKEY_LEN]
                        .copy_from_slice(&slot);
                    slot.zeroize();
                    let gen = self.cache.mark_dirty(work.data[i]);
                    work.pending.push((work.data[i], gen));
                }
                let gen = self.cache.mark_dirty(key_sid);
                work.pending.push((key_sid, gen));
            }
            BioCmd::Delete => {
                for m in &work.maps {
                    crypter.erase(&mut self.cache.sector_mut(key_sid).buf[m.slot..m.slot + SKEY_LEN]);
                }
                let gen = self.cache.mark_dirty(key_sid);
                work.pending.push((key_sid, gen));
            }
        }
        Ok(())
    }

    fn writeback(&mut self, id: WorkId) -> bool {
        let Some(work) = self.works.get(&id) else {
            return false;
        };
        let mut waiting = Vec::new();
        for &(sid, gen) in &work.pending {
            if self.cache.is_flushed(sid, gen) {
                continue;
            }
            if let Some(e) = &self.cache.sector(sid).error {
                let err = e.duplicate();
                self.fail(id, err);
                return true;
            }
            waiting.push(sid);
        }
        if !waiting.is_empty() {
            for sid in waiting {
                self.cache.add_waiter(sid, id);
            }
            return false;
        }
        if let Some(work) = self.works.get_mut(&id) {
            work.state = WorkState::Finish;
        }
        true
    }

    fn finish(&mut self, id: WorkId) {
        let Some(work) = self.works.remove(&id) else {
            return;
        };
        for sid in work.held() {
            self.cache.release(sid);
        }
        debug!(
            work = id,
            bio = work.bio,
            first = work.first,
            count = work.count,
            ok = work.error.is_none(),
            "work finished"
        );

        let complete = match self.bios.get_mut(&work.bio) {
            Some(entry) => {
                if entry.error.is_none() {
                    entry.error = work.error;
                }
                entry.remaining -= 1;
                entry.remaining == 0
            }
            None => false,
        };
        if complete {
            if let Some(entry) = self.bios.remove(&work.bio) {
                let result = match entry.error {
                    Some(e) => Err(e),
                    None => Ok(entry.bio),
                };
                let _ = entry.done.send(result);
            }
        }

        self.ready.extend(self.deferred.drain(..));
    }

    fn fail(&mut self, id: WorkId, err: BdeError) {
        if let Some(work) = self.works.get_mut(&id) {
            work.fail(err);
        }
    }

    /// Fail every work that has not issued any I/O yet.
    fn fail_queued(&mut self) {
        let queued: Vec<WorkId> = self
            .works
            .iter()
            .filter(|(_, w)| w.state == WorkState::Setup)
            .map(|(id, _)| *id)
            .collect();
        if !queued.is_empty() {
            warn!(count = queued.len(), "device gone, failing queued work");
        }
        for id in queued {
            self.fail(id, BdeError::Gone);
            self.ready.push_back(id);
        }
        self.deferred.clear();
    }

    fn issue_read(&mut self, id: SectorId) {
        let offset = self.cache.sector(id).offset;
        let len = self.key.sectorsize as usize;
        let provider = Arc::clone(&self.provider);
        let tx = self.io_tx.clone();
        self.inflight += 1;
        self.backing_reads += 1;
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            let result = provider.read_at(offset, &mut buf).map(|()| buf);
            let _ = tx.send(IoDone::Read { id, result });
        });
    }

    fn issue_write(&mut self, id: SectorId) {
        let Some(w) = self.cache.next_write(id) else {
            return;
        };
        let provider = Arc::clone(&self.provider);
        let tx = self.io_tx.clone();
        self.inflight += 1;
        self.backing_writes += 1;
        tokio::task::spawn_blocking(move || {
            let result = provider.write_at(w.offset, &w.buf);
            let _ = tx.send(IoDone::Write {
                id: w.id,
                gen: w.gen,
                result,
            });
        });
    }

    fn io_done(&mut self, done: IoDone) {
        self.inflight -= 1;
        match done {
            IoDone::Read { id, result } => {
                if let Err(e) = &result {
                    self.note_io_error(e);
                }
                let woken = self.cache.read_done(id, result);
                self.ready.extend(woken);
            }
            IoDone::Write { id, gen, result } => {
                if let Err(e) = &result {
                    self.note_io_error(e);
                }
                let woken = self.cache.write_done(id, gen, result);
                self.ready.extend(woken);
                self.issue_write(id);
            }
        }
    }

    fn note_io_error(&mut self, e: &io::Error) {
        if e.kind() == io::ErrorKind::NotConnected && !self.shared.is_dead() {
            warn!(error = %e, "backing device disconnected");
            self.shared.mark_dead();
            self.fail_queued();
        }
    }

    async fn shutdown(&mut self, reply: oneshot::Sender<BdeResult<()>>) {
        let provider = Arc::clone(&self.provider);
        let flushed = tokio::task::spawn_blocking(move || provider.flush()).await;
        self.key.zeroize();
        let result = match flushed {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BdeError::Io(e)),
            Err(e) => Err(BdeError::Other(anyhow::anyhow!("flush task failed: {e}"))),
        };
        info!(
            reads = self.backing_reads,
            writes = self.backing_writes,
            ok = result.is_ok(),
            "device closed"
        );
        let _ = reply.send(result);
    }
}
