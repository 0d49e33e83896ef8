//! Work items: one per zone-contiguous run of a request.

use gbde_core::{BdeError, BioCmd};
use gbde_lock::SectorMap;

use crate::cache::SectorId;

pub(crate) type WorkId = u64;
pub(crate) type BioId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkState {
    /// Sector fetches not yet issued
    Setup,
    /// Waiting for data or key sectors to arrive
    Wait,
    /// Crypto done, waiting for modified sectors to reach the disk
    Writeback,
    /// Done; references are released and the request is told
    Finish,
}

pub(crate) struct Work {
    pub bio: BioId,
    pub cmd: BioCmd,
    /// First logical sector
    pub first: u64,
    pub count: u64,
    /// Byte offset of this run inside the request buffer
    pub bio_off: usize,
    pub maps: Vec<SectorMap>,
    pub key_sector: Option<SectorId>,
    /// Data sector entries, parallel to `maps`. Empty for deletes.
    pub data: Vec<SectorId>,
    /// Generations this work must see flushed before it finishes
    pub pending: Vec<(SectorId, u64)>,
    pub state: WorkState,
    pub error: Option<BdeError>,
}

impl Work {
    pub fn new(bio: BioId, cmd: BioCmd, first: u64, count: u64, bio_off: usize) -> Self {
        Work {
            bio,
            cmd,
            first,
            count,
            bio_off,
            maps: Vec::new(),
            key_sector: None,
            data: Vec::new(),
            pending: Vec::new(),
            state: WorkState::Setup,
            error: None,
        }
    }

    fn overlaps(&self, other: &Work) -> bool {
        self.first < other.first + other.count && other.first < self.first + self.count
    }

    /// Two works must not run at the same time if they touch a common data
    /// sector and either of them modifies it.
    pub fn conflicts_with(&self, other: &Work) -> bool {
        (self.cmd.mutates() || other.cmd.mutates()) && self.overlaps(other)
    }

    /// Every cache entry this work holds a reference on.
    pub fn held(&self) -> impl Iterator<Item = SectorId> + '_ {
        self.key_sector.iter().chain(self.data.iter()).copied()
    }

    pub fn fail(&mut self, err: BdeError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self.state = WorkState::Finish;
    }
}

/// Split logical sectors `[first, first + count)` into runs that each stay
/// inside one zone.
pub(crate) fn split_by_zone(zone_cont: u64, first: u64, count: u64) -> Vec<(u64, u64)> {
    let mut runs = Vec::new();
    let end = first + count;
    let mut s = first;
    while s < end {
        let zone_end = (s / zone_cont + 1) * zone_cont;
        let run_end = zone_end.min(end);
        runs.push((s, run_end - s));
        s = run_end;
    }
    runs
}
