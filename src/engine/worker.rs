// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Worker-context half of the engine: residency, draining, recovery and
//! teardown. Everything here may block.

use std::sync::{MutexGuard, PoisonError};
use std::time::Instant;

use super::ChecksumEngine;
use crate::context::Worker;
use crate::deferred::DeferredChecksumEntry;
use crate::error::{FilterError, Result};
use crate::table::{ChecksumRegion, Residency};
use crate::types::{RegionIndex, SectorRange};

pub(crate) type ResidencyGuard<'a> = MutexGuard<'a, ()>;

enum Step {
    Replay(DeferredChecksumEntry),
    Recover,
    Idle { drained: bool },
    OutOfTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecoveryPass {
    Complete,
    /// A region could not be made resident.
    Failed,
    /// Something degraded while the pass ran.
    Superseded,
}

impl ChecksumEngine {
    fn lock_residency(&self, _worker: &Worker) -> ResidencyGuard<'_> {
        self.residency.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate and pin `region` if needed. The returned guard keeps the
    /// region from being paged out until it is dropped.
    pub(crate) fn ensure_resident<'a>(
        &'a self,
        worker: &Worker,
        region: RegionIndex,
    ) -> Result<ResidencyGuard<'a>> {
        let guard = self.lock_residency(worker);
        let allocated = {
            let mut st = self.state.lock();
            if st.detached {
                return Err(FilterError::Detached);
            }
            if st.table.check_resident(region) == Residency::Resident {
                return Ok(guard);
            }
            st.table.is_allocated(region)
        };

        self.make_room(worker, region);
        let fresh = if allocated {
            None
        } else {
            Some(ChecksumRegion::allocate(
                region,
                self.geometry.region_sector_count as usize,
            )?)
        };
        self.pager.pin(region, self.config.region_bytes())?;

        let mut st = self.state.lock();
        if let Some(r) = fresh {
            st.table.install(r);
        }
        st.table.mark_resident(region);
        drop(st);
        tracing::debug!(region = region.0, fresh = !allocated, "checksum region resident");
        Ok(guard)
    }

    /// Page out least recently used regions until there is room for one more.
    fn make_room(&self, _worker: &Worker, keep: RegionIndex) {
        let limit = self.config.max_resident_regions;
        if limit == 0 {
            return;
        }
        loop {
            let victim = {
                let st = self.state.lock();
                if st.table.resident_count() < limit {
                    return;
                }
                st.table.lru_victim(keep)
            };
            match victim {
                Some(v) => {
                    self.page_out(v);
                }
                None => return,
            }
        }
    }

    /// Residency lock must be held.
    fn page_out(&self, region: RegionIndex) -> bool {
        let paged = self.state.lock().table.mark_paged_out(region);
        if paged {
            self.pager.unpin(region);
            self.stats.evicted();
            tracing::debug!(region = region.0, "checksum region paged out");
        }
        paged
    }

    /// Makes every region covering `range` resident. Blocks.
    pub fn make_resident(&self, range: SectorRange) -> Result<()> {
        self.validate_range(&range)?;
        let worker = Worker::enter();
        let first = self.geometry.region_for(range.start)?.0;
        let last = self.geometry.region_for(range.last())?.0;
        for region in first..=last {
            self.ensure_resident(&worker, RegionIndex(region))?;
        }
        Ok(())
    }

    /// Pages a region out. Its checksums survive; later operations on it
    /// are deferred until the worker makes it resident again. Blocks.
    pub fn evict_region(&self, region: RegionIndex) -> bool {
        let worker = Worker::enter();
        let _guard = self.lock_residency(&worker);
        self.page_out(region)
    }

    pub(crate) fn drain_worker(&self) {
        let worker = Worker::enter();
        self.drain(&worker, None);
    }

    /// Drains on the calling thread unless a worker is already outstanding.
    /// Returns true if the queue was left empty.
    pub fn drain_now(&self) -> bool {
        {
            let mut st = self.state.lock();
            if st.worker_outstanding {
                return false;
            }
            st.worker_outstanding = true;
        }
        let worker = Worker::enter();
        self.drain(&worker, None)
    }

    /// Caller must own the worker role (`worker_outstanding` set by it).
    fn drain(&self, worker: &Worker, deadline: Option<Instant>) -> bool {
        let mut recovery_tried = false;
        loop {
            let step = {
                let mut st = self.state.lock();
                st.in_flight = None;
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    st.worker_outstanding = false;
                    Step::OutOfTime
                } else if st.exception.is_some() {
                    st.worker_outstanding = false;
                    Step::Idle {
                        drained: st.deferred.is_empty(),
                    }
                } else if let Some(entry) = st.deferred.pop() {
                    st.in_flight = Some(entry.sector);
                    Step::Replay(entry)
                } else if st.needs_critical_recovery && !recovery_tried {
                    Step::Recover
                } else {
                    st.worker_outstanding = false;
                    Step::Idle { drained: true }
                }
            };

            match step {
                Step::Replay(entry) => {
                    recovery_tried = false;
                    self.replay(worker, entry);
                    self.stats.drained();
                }
                Step::Recover => {
                    // Only a failed pass stops retries; a superseded one reruns.
                    recovery_tried = self.critical_recovery(worker) == RecoveryPass::Failed;
                }
                Step::Idle { drained } => {
                    self.notify_idle();
                    return drained;
                }
                Step::OutOfTime => {
                    self.notify_idle();
                    return false;
                }
            }
        }
    }

    fn replay(&self, worker: &Worker, entry: DeferredChecksumEntry) {
        let (region, offset) = self.locate(entry.sector);
        let guard = match self.ensure_resident(worker, region) {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!(sector = entry.sector, "checksum region unavailable: {}", e);
                self.stats.degraded();
                let mut st = self.state.lock();
                st.needs_critical_recovery = true;
                st.recovery.add(region);
                return;
            }
        };

        let mut st = self.state.lock();
        if st.exception.is_some() {
            return;
        }
        if let Err(v) = self.apply(&mut st, region, offset, entry.checksum, entry.direction) {
            let request = entry.request.map(|r| r.request);
            self.raise_locked(st, v, entry.sector, request, false);
        }
        drop(guard);
    }

    /// Wipes every region a degraded fallback may have left stale, so its
    /// checksums are relearned instead of trusted. Clears
    /// `needs_critical_recovery` only if nothing new degraded meanwhile.
    fn critical_recovery(&self, worker: &Worker) -> RecoveryPass {
        let (regions, generation) = {
            let st = self.state.lock();
            let regions = if st.recovery.all {
                st.table.allocated_regions()
            } else {
                let mut v: Vec<RegionIndex> =
                    st.recovery.regions.iter().map(|&r| RegionIndex(r)).collect();
                v.sort_unstable();
                v
            };
            (regions, st.recovery.generation)
        };
        tracing::warn!(regions = regions.len(), "running critical recovery");

        let mut failed = false;
        for &region in &regions {
            if !self.state.lock().table.is_allocated(region) {
                continue;
            }
            match self.ensure_resident(worker, region) {
                Ok(_guard) => {
                    if self.state.lock().table.clear_region(region).is_err() {
                        tracing::warn!(region = region.0, "critical recovery lost residency");
                        failed = true;
                    }
                }
                Err(e) => {
                    tracing::warn!(region = region.0, "critical recovery failed: {}", e);
                    failed = true;
                }
            }
        }

        let mut st = self.state.lock();
        if failed {
            return RecoveryPass::Failed;
        }
        if st.recovery.generation != generation {
            if !st.recovery.all {
                for region in &regions {
                    st.recovery.regions.remove(&region.0);
                }
            }
            return RecoveryPass::Superseded;
        }
        st.recovery.clear();
        st.needs_critical_recovery = false;
        drop(st);
        tracing::info!("critical recovery complete");
        RecoveryPass::Complete
    }

    fn notify_idle(&self) {
        let _g = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.idle.notify_all();
    }

    fn pending_error(&self) -> FilterError {
        FilterError::PendingWorkRemaining {
            remaining: self.state.lock().deferred.len(),
        }
    }

    /// Detach: drain the deferred queue within `teardown_timeout`, then
    /// release all checksum memory. I/O arriving once the drain has started
    /// gets `Detached`. On timeout nothing is released, I/O is accepted
    /// again and the caller decides between calling again and
    /// `discard_pending`.
    pub fn teardown(&self) -> Result<()> {
        let worker = Worker::enter();
        let deadline = Instant::now() + self.config.teardown_timeout();
        {
            let mut idle = self.idle_lock.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                {
                    let mut st = self.state.lock();
                    if !st.worker_outstanding {
                        st.worker_outstanding = true;
                        st.detaching = true;
                        break;
                    }
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(self.pending_error());
                }
                idle = self
                    .idle
                    .wait_timeout(idle, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }

        if !self.drain(&worker, Some(deadline)) {
            self.state.lock().detaching = false;
            let err = self.pending_error();
            tracing::warn!("teardown incomplete: {}", err);
            return Err(err);
        }
        self.release(&worker);
        Ok(())
    }

    /// Drops queued work after a failed teardown and releases the device.
    /// Returns how many operations were lost.
    pub fn discard_pending(&self) -> usize {
        let worker = Worker::enter();
        let dropped = {
            let mut st = self.state.lock();
            let n = st.deferred.discard();
            if n > 0 {
                st.needs_critical_recovery = true;
                st.recovery.add_all();
            }
            n
        };
        if dropped > 0 {
            self.stats.degraded();
            tracing::warn!(dropped, "discarded deferred checksum operations");
        }
        self.release(&worker);
        dropped
    }

    fn release(&self, worker: &Worker) {
        let _guard = self.lock_residency(worker);
        let pinned = {
            let mut st = self.state.lock();
            st.detached = true;
            st.table.release_all()
        };
        for region in pinned {
            self.pager.unpin(region);
        }
        tracing::info!("checksum engine detached");
    }
}
