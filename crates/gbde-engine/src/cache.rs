//! Sector cache: one entry per physical sector in use or recently used.
//!
//! Entries live in an arena indexed by [`SectorId`]. An entry is found by
//! physical offset through `index`; a VALID entry nobody references sits on
//! the LRU free list and may be reclaimed at any time. The cache only keeps
//! the books. The worker issues the reads and writes it asks for and reports
//! their completion back.
//!
//! Modified sectors carry a generation counter. At most one write per entry
//! is outstanding; a write carries a snapshot of the buffer and the
//! generation it makes durable.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::time::{Duration, Instant};

use gbde_core::BdeError;

use crate::work::WorkId;

pub(crate) type SectorId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SectorState {
    /// Allocated, contents undefined
    Junk,
    /// Read outstanding against the backing device
    Io,
    /// Contents present
    Valid,
}

/// What the caller is about to do with a sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fetch {
    /// Needs the on-disk contents
    Read,
    /// Will replace the whole sector; no read needed
    Overwrite,
}

pub(crate) struct Sector {
    pub offset: u64,
    pub state: SectorState,
    pub refs: usize,
    pub buf: Vec<u8>,
    pub error: Option<BdeError>,
    waiters: Vec<WorkId>,
    dirty_gen: u64,
    flushed_gen: u64,
    writing: Option<u64>,
    live: bool,
    indexed: bool,
    free_seq: Option<u64>,
    released_at: Instant,
}

impl Sector {
    fn vacant() -> Self {
        Sector {
            offset: 0,
            state: SectorState::Junk,
            refs: 0,
            buf: Vec::new(),
            error: None,
            waiters: Vec::new(),
            dirty_gen: 0,
            flushed_gen: 0,
            writing: None,
            live: false,
            indexed: false,
            free_seq: None,
            released_at: Instant::now(),
        }
    }

    /// Reset for a new physical offset, keeping the buffer allocation.
    fn relabel(&mut self, offset: u64, size: usize) {
        let buf = std::mem::take(&mut self.buf);
        *self = Sector::vacant();
        self.buf = buf;
        self.buf.clear();
        self.buf.resize(size, 0);
        self.offset = offset;
        self.live = true;
        self.indexed = true;
    }
}

/// A write the worker must issue.
pub(crate) struct PendingWrite {
    pub id: SectorId,
    pub offset: u64,
    pub gen: u64,
    pub buf: Vec<u8>,
}

pub(crate) struct SectorCache {
    slots: Vec<Sector>,
    vacant: Vec<SectorId>,
    index: HashMap<u64, SectorId>,
    free: BTreeMap<u64, SectorId>,
    next_seq: u64,
    live: usize,
    sector_size: usize,
    max_sectors: usize,
    pub hits: u64,
}

impl SectorCache {
    pub fn new(sector_size: usize, max_sectors: usize) -> Self {
        SectorCache {
            slots: Vec::new(),
            vacant: Vec::new(),
            index: HashMap::new(),
            free: BTreeMap::new(),
            next_seq: 0,
            live: 0,
            sector_size,
            max_sectors: max_sectors.max(1),
            hits: 0,
        }
    }

    pub fn sector(&self, id: SectorId) -> &Sector {
        debug_assert!(self.slots[id].live, "lookup of vacant sector {id}");
        &self.slots[id]
    }

    pub fn sector_mut(&mut self, id: SectorId) -> &mut Sector {
        &mut self.slots[id]
    }

    /// Take a reference on the sector at `offset`.
    ///
    /// Returns the entry and whether the caller must issue a read for it.
    /// A sector already VALID or being read is shared.
    pub fn get(&mut self, offset: u64, fetch: Fetch) -> (SectorId, bool) {
        if let Some(&id) = self.index.get(&offset) {
            self.hits += 1;
            let s = &mut self.slots[id];
            if let Some(seq) = s.free_seq.take() {
                self.free.remove(&seq);
            }
            s.refs += 1;
            let needs_read = fetch == Fetch::Read && s.state == SectorState::Junk;
            if needs_read {
                s.state = SectorState::Io;
            }
            return (id, needs_read);
        }

        let id = self.alloc(offset);
        let s = &mut self.slots[id];
        s.refs = 1;
        s.state = match fetch {
            Fetch::Read => SectorState::Io,
            Fetch::Overwrite => SectorState::Junk,
        };
        self.index.insert(offset, id);
        (id, fetch == Fetch::Read)
    }

    fn alloc(&mut self, offset: u64) -> SectorId {
        if self.live >= self.max_sectors {
            if let Some((_, victim)) = self.free.pop_first() {
                let old = self.slots[victim].offset;
                self.index.remove(&old);
                self.slots[victim].relabel(offset, self.sector_size);
                tracing::debug!(old, new = offset, "reclaimed cached sector");
                return victim;
            }
        }

        self.live += 1;
        match self.vacant.pop() {
            Some(id) => {
                self.slots[id].relabel(offset, self.sector_size);
                id
            }
            None => {
                let mut s = Sector::vacant();
                s.relabel(offset, self.sector_size);
                self.slots.push(s);
                self.slots.len() - 1
            }
        }
    }

    /// Drop a reference. An unreferenced entry becomes reclaimable if its
    /// contents are good, and is discarded otherwise.
    pub fn release(&mut self, id: SectorId) {
        let s = &mut self.slots[id];
        debug_assert!(s.refs > 0, "release of unreferenced sector");
        s.refs = s.refs.saturating_sub(1);
        self.settle(id);
    }

    fn settle(&mut self, id: SectorId) {
        let s = &mut self.slots[id];
        // an entry with a read or write outstanding keeps its slot until the
        // completion lands; read_done/write_done settle it again
        if s.refs > 0 || s.writing.is_some() || s.state == SectorState::Io {
            return;
        }
        if s.error.is_none() && s.dirty_gen != s.flushed_gen {
            // the next write is still to be issued
            return;
        }
        if s.indexed && s.state == SectorState::Valid && s.error.is_none() {
            let seq = self.next_seq;
            self.next_seq += 1;
            s.free_seq = Some(seq);
            s.released_at = Instant::now();
            self.free.insert(seq, id);
        } else {
            self.vacate(id);
        }
    }

    fn vacate(&mut self, id: SectorId) {
        self.detach(id);
        let s = &mut self.slots[id];
        if let Some(seq) = s.free_seq.take() {
            self.free.remove(&seq);
        }
        s.live = false;
        s.buf = Vec::new();
        self.live -= 1;
        self.vacant.push(id);
    }

    /// Remove from the offset index so the next lookup starts afresh.
    fn detach(&mut self, id: SectorId) {
        let s = &mut self.slots[id];
        if s.indexed {
            s.indexed = false;
            if self.index.get(&s.offset) == Some(&id) {
                self.index.remove(&s.offset);
            }
        }
    }

    pub fn add_waiter(&mut self, id: SectorId, work: WorkId) {
        let waiters = &mut self.slots[id].waiters;
        if !waiters.contains(&work) {
            waiters.push(work);
        }
    }

    /// Record the outcome of a read. Returns the work items to wake.
    pub fn read_done(&mut self, id: SectorId, result: io::Result<Vec<u8>>) -> Vec<WorkId> {
        let s = &mut self.slots[id];
        match result {
            Ok(buf) => {
                s.buf = buf;
                s.state = SectorState::Valid;
            }
            Err(e) => {
                tracing::warn!(offset = s.offset, error = %e, "sector read failed");
                s.error = Some(BdeError::sector_io(s.offset, &e));
                s.state = SectorState::Junk;
                self.detach(id);
            }
        }
        let waiters = std::mem::take(&mut self.slots[id].waiters);
        if self.slots[id].refs == 0 {
            self.settle(id);
        }
        waiters
    }

    /// Note that the buffer was modified. Returns the generation a later
    /// write must reach for this change to be durable.
    pub fn mark_dirty(&mut self, id: SectorId) -> u64 {
        let s = &mut self.slots[id];
        s.state = SectorState::Valid;
        s.dirty_gen += 1;
        s.dirty_gen
    }

    /// The next write to issue for this entry, if one is due.
    pub fn next_write(&mut self, id: SectorId) -> Option<PendingWrite> {
        let s = &mut self.slots[id];
        if s.writing.is_some() || s.error.is_some() || s.dirty_gen == s.flushed_gen {
            return None;
        }
        s.writing = Some(s.dirty_gen);
        Some(PendingWrite {
            id,
            offset: s.offset,
            gen: s.dirty_gen,
            buf: s.buf.clone(),
        })
    }

    /// Record the outcome of a write. Returns the work items to wake.
    ///
    /// A failed write leaves the entry unusable; anyone still holding it sees
    /// the error and the next lookup of the offset reads from disk again.
    pub fn write_done(&mut self, id: SectorId, gen: u64, result: io::Result<()>) -> Vec<WorkId> {
        let s = &mut self.slots[id];
        s.writing = None;
        match result {
            Ok(()) => s.flushed_gen = s.flushed_gen.max(gen),
            Err(e) => {
                tracing::warn!(offset = s.offset, gen, error = %e, "sector write failed");
                s.error = Some(BdeError::sector_io(s.offset, &e));
                self.detach(id);
            }
        }
        let waiters = std::mem::take(&mut self.slots[id].waiters);
        if self.slots[id].refs == 0 {
            self.settle(id);
        }
        waiters
    }

    pub fn is_flushed(&self, id: SectorId, gen: u64) -> bool {
        self.slots[id].flushed_gen >= gen
    }

    /// Discard reclaimable entries unused for at least `max_idle`.
    pub fn purge_idle(&mut self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<SectorId> = self
            .free
            .values()
            .copied()
            .filter(|&id| now.duration_since(self.slots[id].released_at) >= max_idle)
            .collect();
        for &id in &stale {
            self.vacate(id);
        }
        stale.len()
    }

    /// Entries currently allocated.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Entries on the free list.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max: usize) -> SectorCache {
        SectorCache::new(512, max)
    }

    fn fill(c: &mut SectorCache, id: SectorId, byte: u8) {
        c.read_done(id, Ok(vec![byte; 512]));
    }

    #[test]
    fn concurrent_lookups_share_one_read() {
        let mut c = cache(16);
        let (a, read_a) = c.get(4096, Fetch::Read);
        let (b, read_b) = c.get(4096, Fetch::Read);
        assert_eq!(a, b);
        assert!(read_a);
        assert!(!read_b);
        assert_eq!(c.sector(a).refs, 2);
        assert_eq!(c.sector(a).state, SectorState::Io);

        c.add_waiter(a, 1);
        c.add_waiter(a, 2);
        c.add_waiter(a, 1);
        assert_eq!(c.read_done(a, Ok(vec![7; 512])), vec![1, 2]);
        assert_eq!(c.sector(a).state, SectorState::Valid);
    }

    #[test]
    fn entry_released_mid_read_keeps_its_slot() {
        let mut c = cache(16);
        let (id, needs_read) = c.get(4096, Fetch::Read);
        assert!(needs_read);
        c.release(id);
        assert_eq!(c.len(), 1);

        // a new offset must not be handed the slot of the pending read
        let (other, _) = c.get(8192, Fetch::Read);
        assert_ne!(other, id);

        // a lookup of the same offset joins the pending read
        let (again, needs_read) = c.get(4096, Fetch::Read);
        assert_eq!(again, id);
        assert!(!needs_read);
        c.release(again);

        c.read_done(id, Ok(vec![3; 512]));
        assert_eq!(c.sector(id).state, SectorState::Valid);
        assert_eq!(c.free_len(), 1);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn failed_read_of_released_entry_vacates_once() {
        let mut c = cache(16);
        let (id, _) = c.get(4096, Fetch::Read);
        c.release(id);
        c.read_done(id, Err(io::Error::new(io::ErrorKind::Other, "bad sector")));
        assert_eq!(c.len(), 0);
        assert_eq!(c.free_len(), 0);

        let (a, _) = c.get(512, Fetch::Read);
        let (b, _) = c.get(1024, Fetch::Read);
        assert_ne!(a, b);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn released_valid_sector_is_cached() {
        let mut c = cache(16);
        let (id, _) = c.get(512, Fetch::Read);
        fill(&mut c, id, 1);
        c.release(id);
        assert_eq!(c.free_len(), 1);

        let (again, needs_read) = c.get(512, Fetch::Read);
        assert_eq!(again, id);
        assert!(!needs_read);
        assert_eq!(c.free_len(), 0);
        assert_eq!(c.sector(again).buf, vec![1; 512]);
        assert_eq!(c.hits, 1);
    }

    #[test]
    fn lru_entry_reclaimed_at_capacity() {
        let mut c = cache(2);
        let (a, _) = c.get(0, Fetch::Read);
        fill(&mut c, a, 1);
        let (b, _) = c.get(512, Fetch::Read);
        fill(&mut c, b, 2);
        c.release(a);
        c.release(b);

        let (n, needs_read) = c.get(1024, Fetch::Read);
        assert_eq!(n, a, "oldest free entry reused");
        assert!(needs_read);
        assert_eq!(c.len(), 2);

        // 512 is still cached, 0 was evicted
        let (_, r512) = c.get(512, Fetch::Read);
        assert!(!r512);
        let (_, r0) = c.get(0, Fetch::Read);
        assert!(r0);
    }

    #[test]
    fn referenced_or_busy_entries_never_reclaimed() {
        let mut c = cache(1);
        let (a, _) = c.get(0, Fetch::Read);
        let (b, _) = c.get(512, Fetch::Read);
        assert_ne!(a, b);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn read_error_reaches_holder_and_forces_refetch() {
        let mut c = cache(16);
        let (id, _) = c.get(2048, Fetch::Read);
        c.read_done(id, Err(io::Error::new(io::ErrorKind::Other, "bad block")));
        assert!(matches!(
            c.sector(id).error,
            Some(BdeError::SectorIo { offset: 2048, .. })
        ));

        let (fresh, needs_read) = c.get(2048, Fetch::Read);
        assert_ne!(fresh, id);
        assert!(needs_read);

        c.release(id);
        assert_eq!(c.free_len(), 0);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn one_write_in_flight_per_sector() {
        let mut c = cache(16);
        let (id, _) = c.get(0, Fetch::Read);
        fill(&mut c, id, 0);

        c.sector_mut(id).buf[0] = 1;
        let g1 = c.mark_dirty(id);
        let w1 = c.next_write(id).unwrap();
        assert_eq!(w1.gen, g1);
        assert_eq!(w1.buf[0], 1);

        c.sector_mut(id).buf[1] = 2;
        let g2 = c.mark_dirty(id);
        assert!(c.next_write(id).is_none());

        c.write_done(id, w1.gen, Ok(()));
        assert!(c.is_flushed(id, g1));
        assert!(!c.is_flushed(id, g2));

        let w2 = c.next_write(id).unwrap();
        assert_eq!(w2.gen, g2);
        assert_eq!(&w2.buf[..2], &[1, 2]);
        c.write_done(id, w2.gen, Ok(()));
        assert!(c.is_flushed(id, g2));
        assert!(c.next_write(id).is_none());
    }

    #[test]
    fn failed_write_poisons_entry() {
        let mut c = cache(16);
        let (id, _) = c.get(0, Fetch::Overwrite);
        let gen = c.mark_dirty(id);
        let w = c.next_write(id).unwrap();
        c.add_waiter(id, 9);
        let woken = c.write_done(id, w.gen, Err(io::Error::new(io::ErrorKind::Other, "eio")));
        assert_eq!(woken, vec![9]);
        assert!(!c.is_flushed(id, gen));
        assert!(c.sector(id).error.is_some());
        assert!(c.next_write(id).is_none());

        c.release(id);
        assert_eq!(c.len(), 0);
        let (_, needs_read) = c.get(0, Fetch::Read);
        assert!(needs_read);
    }

    #[test]
    fn entry_with_write_in_flight_waits_before_caching() {
        let mut c = cache(16);
        let (id, _) = c.get(0, Fetch::Overwrite);
        c.mark_dirty(id);
        let w = c.next_write(id).unwrap();
        c.release(id);
        assert_eq!(c.free_len(), 0);
        c.write_done(id, w.gen, Ok(()));
        assert_eq!(c.free_len(), 1);
    }

    #[test]
    fn unwritten_overwrite_entry_discarded() {
        let mut c = cache(16);
        let (id, needs_read) = c.get(0, Fetch::Overwrite);
        assert!(!needs_read);
        c.release(id);
        assert_eq!(c.len(), 0);
        let (_, needs_read) = c.get(0, Fetch::Read);
        assert!(needs_read);
    }

    #[test]
    fn idle_entries_purged() {
        let mut c = cache(16);
        let (id, _) = c.get(0, Fetch::Read);
        fill(&mut c, id, 3);
        c.release(id);
        assert_eq!(c.purge_idle(Duration::from_secs(3600)), 0);
        assert_eq!(c.purge_idle(Duration::ZERO), 1);
        assert_eq!(c.len(), 0);
        assert_eq!(c.free_len(), 0);
    }
}
