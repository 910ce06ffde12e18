// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Verification / update engine.
//!
//! For every sector an I/O touched the engine computes a checksum and,
//! under the device's fast lock, either stores it (write) or compares it
//! with the stored one (read). If the sector's region is not resident, or
//! the sector already has work queued, the operation is appended to the
//! deferred queue instead and replayed by the drain worker (`worker.rs`).
//!
//! Locks:
//! - `state` is the fast lock (`spin::Mutex`). Taken from any context;
//!   critical sections are O(1) on the elevated path.
//! - `residency` is the blocking lock (`std::sync::Mutex`). Only taken
//!   with a `Worker` token, always before `state`, never while holding it.

mod worker;

use std::sync::{Arc, Condvar, Mutex, Weak};

use rustc_hash::FxHashSet;

use crate::checksum::ChecksumValue;
use crate::config::FilterConfig;
use crate::deferred::{DeferredChecksumEntry, DeferredQueue, RequestSnapshot};
use crate::error::{FilterError, Result};
use crate::fault::{self, FaultKind, FaultReport, FaultSnapshot};
use crate::forensic::{AccessLog, AccessRecord};
use crate::scheduler::WorkScheduler;
use crate::stats::{Stats, StatsSnapshot};
use crate::table::{ChecksumTable, Geometry, NoopPager, RegionPager, Residency, SlotError};
use crate::types::{IoDirection, IoRequest, RegionIndex, RequestId, SectorRange, VerificationOutcome};

type StateGuard<'a> = spin::MutexGuard<'a, DeviceChecksumState>;

/// Regions whose stored checksums may be stale after a degraded fallback.
#[derive(Debug, Default)]
pub(crate) struct RecoveryScope {
    regions: FxHashSet<u64>,
    all: bool,
    generation: u64,
}

impl RecoveryScope {
    pub(crate) fn add(&mut self, region: RegionIndex) {
        self.generation += 1;
        if self.all {
            return;
        }
        if self.regions.try_reserve(1).is_err() {
            self.all = true;
            return;
        }
        self.regions.insert(region.0);
    }

    pub(crate) fn add_all(&mut self) {
        self.generation += 1;
        self.all = true;
    }

    pub(crate) fn covers(&self, region: RegionIndex) -> bool {
        self.all || self.regions.contains(&region.0)
    }

    pub(crate) fn clear(&mut self) {
        self.regions.clear();
        self.all = false;
    }
}

/// Everything the fast lock protects for one device.
#[derive(Debug)]
pub struct DeviceChecksumState {
    pub(crate) table: ChecksumTable,
    pub(crate) deferred: DeferredQueue,
    pub(crate) access_log: AccessLog,
    pub(crate) recovery: RecoveryScope,
    pub(crate) needs_critical_recovery: bool,
    pub(crate) is_raising_exception: bool,
    pub(crate) exception: Option<FaultSnapshot>,
    pub(crate) worker_outstanding: bool,
    /// Sector the drain worker is replaying right now.
    pub(crate) in_flight: Option<u64>,
    /// Teardown owns the worker role and is draining; no new work is taken.
    pub(crate) detaching: bool,
    pub(crate) detached: bool,
}

impl DeviceChecksumState {
    fn new(config: &FilterConfig) -> Self {
        Self {
            table: ChecksumTable::new(),
            deferred: DeferredQueue::new(config.max_deferred_entries),
            access_log: AccessLog::with_capacity(config.forensic_log_len),
            recovery: RecoveryScope::default(),
            needs_critical_recovery: false,
            is_raising_exception: false,
            exception: None,
            worker_outstanding: false,
            in_flight: None,
            detaching: false,
            detached: false,
        }
    }

    /// Work for `sector` is queued or being replayed, so a new operation
    /// on it must queue behind.
    fn ordered_behind(&self, sector: u64) -> bool {
        self.in_flight == Some(sector) || self.deferred.contains_sector(sector)
    }

    fn is_closed(&self) -> bool {
        self.detaching || self.detached
    }
}

/// Result of reading one stored slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotRead {
    Value(ChecksumValue),
    NotResident,
    FaultRaised(FaultKind),
}

struct Violation {
    kind: FaultKind,
    expected: ChecksumValue,
    found: ChecksumValue,
}

pub struct ChecksumEngine {
    config: FilterConfig,
    geometry: Geometry,
    state: spin::Mutex<DeviceChecksumState>,
    residency: Mutex<()>,
    idle_lock: Mutex<()>,
    idle: Condvar,
    pager: Arc<dyn RegionPager>,
    scheduler: Arc<dyn WorkScheduler>,
    stats: Stats,
    this: Weak<ChecksumEngine>,
}

impl ChecksumEngine {
    pub fn new(
        config: FilterConfig,
        scheduler: Arc<dyn WorkScheduler>,
        pager: Arc<dyn RegionPager>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        tracing::info!(
            sector_size = config.sector_size,
            region_sectors = config.region_sector_count,
            max_regions = config.max_regions,
            "attaching checksum engine"
        );
        Ok(Arc::new_cyclic(|this| Self {
            geometry: Geometry::from_config(&config),
            state: spin::Mutex::new(DeviceChecksumState::new(&config)),
            residency: Mutex::new(()),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            pager,
            scheduler,
            stats: Stats::default(),
            this: this.clone(),
            config,
        }))
    }

    /// Engine backed by plain heap memory.
    pub fn with_scheduler(config: FilterConfig, scheduler: Arc<dyn WorkScheduler>) -> Result<Arc<Self>> {
        Self::new(config, scheduler, Arc::new(NoopPager))
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    pub fn region_for(&self, sector: u64) -> Result<RegionIndex> {
        self.geometry.region_for(sector)
    }

    fn validate_range(&self, range: &SectorRange) -> Result<()> {
        if range.count == 0 {
            return Err(FilterError::InvalidArgument("empty sector range"));
        }
        if range.start.checked_add(range.count as u64).is_none() {
            return Err(FilterError::InvalidArgument("sector range overflows"));
        }
        self.geometry.region_for(range.start)?;
        self.geometry.region_for(range.last())?;
        Ok(())
    }

    fn locate(&self, sector: u64) -> (RegionIndex, usize) {
        (
            RegionIndex(sector / self.geometry.region_sector_count),
            self.geometry.offset_in_region(sector),
        )
    }

    /// Entry point for every completed read and successful write.
    ///
    /// Elevated-context safe: never blocks and never pages anything in.
    pub fn on_io_range_touched(&self, request: &IoRequest<'_>) -> Result<VerificationOutcome> {
        self.validate_range(&request.range)?;
        let ss = self.config.sector_size;
        let expected_len = (request.range.count as usize)
            .checked_mul(ss)
            .ok_or(FilterError::InvalidArgument("transfer too large"))?;
        if request.buffer.len() != expected_len {
            return Err(FilterError::InvalidArgument("buffer length does not match sector range"));
        }
        {
            let st = self.state.lock();
            if st.is_closed() {
                return Err(FilterError::Detached);
            }
            if let Some(snap) = st.exception {
                return Ok(VerificationOutcome::FaultRaised(snap.kind));
            }
        }

        let mut outcome = VerificationOutcome::Verified;
        for (sector, data) in request.range.sectors().zip(request.buffer.chunks_exact(ss)) {
            let checksum = ChecksumValue::of(data);
            outcome = outcome.merge(self.check_sector(sector, checksum, request)?);
            if outcome.is_fault() {
                break;
            }
        }
        Ok(outcome)
    }

    fn check_sector(
        &self,
        sector: u64,
        checksum: ChecksumValue,
        request: &IoRequest<'_>,
    ) -> Result<VerificationOutcome> {
        let (region, offset) = self.locate(sector);
        let mut st = self.state.lock();
        if st.is_closed() {
            return Err(FilterError::Detached);
        }
        if let Some(snap) = st.exception {
            return Ok(VerificationOutcome::FaultRaised(snap.kind));
        }
        st.access_log.record(sector, checksum, request.direction);

        if st.ordered_behind(sector) || st.table.check_resident(region) == Residency::NeedsDefer {
            let entry = DeferredChecksumEntry {
                sector,
                checksum,
                direction: request.direction,
                request: Some(RequestSnapshot {
                    request: request.id,
                    range: request.range,
                }),
            };
            return Ok(self.defer(st, entry));
        }

        Ok(match self.apply(&mut st, region, offset, checksum, request.direction) {
            Ok(()) => VerificationOutcome::Verified,
            Err(v) => self.raise_locked(st, v, sector, Some(request.id), true),
        })
    }

    /// Compare or store against a resident region.
    fn apply(
        &self,
        st: &mut DeviceChecksumState,
        region: RegionIndex,
        offset: usize,
        checksum: ChecksumValue,
        direction: IoDirection,
    ) -> std::result::Result<(), Violation> {
        match direction {
            IoDirection::Write => {
                if st.table.write_entry(region, offset, checksum).is_ok() {
                    if checksum.is_unknown() {
                        self.stats.invalidated();
                    } else {
                        self.stats.stored();
                    }
                }
                Ok(())
            }
            IoDirection::Read => {
                let stored = match st.table.read_entry(region, offset) {
                    Ok(v) => v,
                    Err(SlotError::Corrupt(m)) => {
                        return Err(Violation {
                            kind: FaultKind::MetadataCorruption,
                            expected: m.primary,
                            found: m.shadow,
                        })
                    }
                    // Callers establish residency under the same lock.
                    Err(SlotError::NotResident) => return Ok(()),
                };
                // Stale until the recovery pass wipes it.
                if st.recovery.covers(region) {
                    return Ok(());
                }
                if stored.is_unknown() {
                    if self.config.learn_on_first_read
                        && st.table.write_entry(region, offset, checksum).is_ok()
                    {
                        self.stats.stored();
                    }
                    return Ok(());
                }
                if stored != checksum {
                    return Err(Violation {
                        kind: FaultKind::DataMismatch,
                        expected: stored,
                        found: checksum,
                    });
                }
                self.stats.verified();
                Ok(())
            }
        }
    }

    fn defer(&self, mut st: StateGuard<'_>, entry: DeferredChecksumEntry) -> VerificationOutcome {
        let queued = match st.deferred.push(entry) {
            Ok(()) => true,
            Err(entry) => {
                self.degrade_locked(&mut st, &entry);
                false
            }
        };
        let schedule = !std::mem::replace(&mut st.worker_outstanding, true);
        drop(st);

        if queued {
            self.stats.deferred();
            tracing::debug!(sector = entry.sector, "checksum deferred");
        } else {
            tracing::warn!(sector = entry.sector, "deferred queue exhausted, checksum dropped");
        }
        if schedule {
            self.schedule_drain();
        }
        VerificationOutcome::Deferred
    }

    /// An operation could neither run nor be queued.
    fn degrade_locked(&self, st: &mut DeviceChecksumState, entry: &DeferredChecksumEntry) {
        self.stats.degraded();
        let (region, offset) = self.locate(entry.sector);
        if entry.is_write() && st.table.write_entry(region, offset, ChecksumValue::UNKNOWN).is_ok() {
            self.stats.invalidated();
            // Nothing queued for the sector can overwrite the sentinel.
            if !st.ordered_behind(entry.sector) {
                return;
            }
        }
        st.needs_critical_recovery = true;
        st.recovery.add(region);
    }

    fn schedule_drain(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.stats.worker_scheduled();
        if let Err(e) = self.scheduler.schedule(Box::new(move || this.drain_worker())) {
            tracing::warn!("drain worker not scheduled: {}", e);
            self.state.lock().worker_outstanding = false;
        }
    }

    /// Capture the fault, release the lock, then report.
    fn raise_locked(
        &self,
        mut st: StateGuard<'_>,
        v: Violation,
        sector: u64,
        request: Option<RequestId>,
        synchronous: bool,
    ) -> VerificationOutcome {
        st.is_raising_exception = true;
        let first = st.exception.is_none();
        let snapshot = FaultSnapshot {
            kind: v.kind,
            sector,
            request,
            synchronous,
            expected: v.expected,
            found: v.found,
        };
        if first {
            st.exception = Some(snapshot);
        }
        drop(st);

        if first {
            self.stats.fault();
            fault::report(&snapshot, self.config.fault_policy);
        }
        VerificationOutcome::FaultRaised(v.kind)
    }

    /// Raise a fault detected outside the engine.
    pub fn raise_fault(
        &self,
        kind: FaultKind,
        sector: u64,
        request: Option<RequestId>,
        synchronous: bool,
    ) -> VerificationOutcome {
        let st = self.state.lock();
        let v = Violation {
            kind,
            expected: ChecksumValue::UNKNOWN,
            found: ChecksumValue::UNKNOWN,
        };
        self.raise_locked(st, v, sector, request, synchronous)
    }

    /// Forget stored checksums for sectors a write only partly covered.
    ///
    /// Resident slots are reset at once. Sectors with queued work, or in a
    /// paged-out region, get a queued reset so ordering is kept. Regions
    /// never allocated hold nothing and are skipped.
    pub fn invalidate_range(&self, range: SectorRange) -> Result<()> {
        self.validate_range(&range)?;
        for sector in range.sectors() {
            let (region, offset) = self.locate(sector);
            let mut st = self.state.lock();
            if st.is_closed() {
                return Err(FilterError::Detached);
            }
            if st.exception.is_some() {
                return Ok(());
            }
            if !st.ordered_behind(sector) {
                match st.table.check_resident(region) {
                    Residency::Resident => {
                        if st.table.write_entry(region, offset, ChecksumValue::UNKNOWN).is_ok() {
                            self.stats.invalidated();
                            continue;
                        }
                    }
                    Residency::NeedsDefer if !st.table.is_allocated(region) => continue,
                    Residency::NeedsDefer => {}
                }
            }
            let entry = DeferredChecksumEntry {
                sector,
                checksum: ChecksumValue::UNKNOWN,
                direction: IoDirection::Write,
                request: None,
            };
            self.defer(st, entry);
        }
        Ok(())
    }

    /// Non-blocking residency check for the elevated context.
    pub fn try_resident(&self, region: RegionIndex) -> Residency {
        self.state.lock().table.check_resident(region)
    }

    /// Reads the stored checksum for `sector`, checking it against its
    /// shadow copy. A mismatch raises `MetadataCorruption`.
    pub fn stored_checksum(&self, sector: u64) -> Result<SlotRead> {
        let (region, offset) = self.locate(sector);
        self.geometry.region_for(sector)?;
        let st = self.state.lock();
        match st.table.read_entry(region, offset) {
            Ok(v) => Ok(SlotRead::Value(v)),
            Err(SlotError::NotResident) => Ok(SlotRead::NotResident),
            Err(SlotError::Corrupt(m)) => {
                let v = Violation {
                    kind: FaultKind::MetadataCorruption,
                    expected: m.primary,
                    found: m.shadow,
                };
                match self.raise_locked(st, v, sector, None, true) {
                    VerificationOutcome::FaultRaised(kind) => Ok(SlotRead::FaultRaised(kind)),
                    _ => Ok(SlotRead::NotResident),
                }
            }
        }
    }

    pub fn is_resident(&self, region: RegionIndex) -> bool {
        self.state.lock().table.is_resident(region)
    }

    pub fn resident_regions(&self) -> usize {
        self.state.lock().table.resident_count()
    }

    pub fn pending_deferred(&self) -> usize {
        self.state.lock().deferred.len()
    }

    pub fn is_sector_deferred(&self, sector: u64) -> bool {
        self.state.lock().ordered_behind(sector)
    }

    pub fn is_worker_outstanding(&self) -> bool {
        self.state.lock().worker_outstanding
    }

    pub fn needs_critical_recovery(&self) -> bool {
        self.state.lock().needs_critical_recovery
    }

    pub fn is_raising_exception(&self) -> bool {
        self.state.lock().is_raising_exception
    }

    pub fn exception(&self) -> Option<FaultSnapshot> {
        self.state.lock().exception
    }

    pub fn recent_accesses(&self) -> Vec<AccessRecord> {
        self.state.lock().access_log.recent()
    }

    /// Exception snapshot with the access history, once a fault was raised.
    pub fn fault_report(&self) -> Option<FaultReport> {
        let st = self.state.lock();
        let snapshot = st.exception?;
        let recent = st.access_log.recent();
        Some(FaultReport::new(snapshot, recent))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut DeviceChecksumState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

impl Drop for ChecksumEngine {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        if st.detached {
            return;
        }
        for region in st.table.release_all() {
            self.pager.unpin(region);
        }
    }
}
