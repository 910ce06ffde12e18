// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Per-device counters, mirrored to the `metrics` recorder.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub verified: u64,
    pub stored: u64,
    pub deferred: u64,
    pub drained: u64,
    pub invalidated: u64,
    pub degraded: u64,
    pub faults: u64,
    pub worker_schedules: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
pub struct Stats {
    verified: AtomicU64,
    stored: AtomicU64,
    deferred: AtomicU64,
    drained: AtomicU64,
    invalidated: AtomicU64,
    degraded: AtomicU64,
    faults: AtomicU64,
    worker_schedules: AtomicU64,
    evictions: AtomicU64,
}

impl Stats {
    pub fn verified(&self) {
        self.verified.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("crcfilter_sectors_verified_total");
    }

    pub fn stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("crcfilter_sectors_stored_total");
    }

    pub fn deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("crcfilter_sectors_deferred_total");
    }

    pub fn drained(&self) {
        self.drained.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidated(&self) {
        self.invalidated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("crcfilter_degraded_total");
    }

    pub fn fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_scheduled(&self) {
        self.worker_schedules.fetch_add(1, Ordering::Relaxed);
    }

    pub fn evicted(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            verified: self.verified.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            worker_schedules: self.worker_schedules.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
