// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Deferred checksum operations.
//!
//! FIFO of compare/store operations that could not run in the elevated
//! context, plus a per-sector count so the fast path can tell in O(1)
//! whether a sector already has work queued.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumValue;
use crate::types::{IoDirection, RequestId, SectorRange};

/// The originating request, captured for synchronous checks only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub request: RequestId,
    pub range: SectorRange,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeferredChecksumEntry {
    pub sector: u64,
    /// For writes, the value to store. `UNKNOWN` queues an invalidation.
    pub checksum: ChecksumValue,
    pub direction: IoDirection,
    pub request: Option<RequestSnapshot>,
}

impl DeferredChecksumEntry {
    pub fn is_write(&self) -> bool {
        self.direction.is_write()
    }
}

#[derive(Debug)]
pub struct DeferredQueue {
    entries: VecDeque<DeferredChecksumEntry>,
    pending: FxHashMap<u64, u32>,
    capacity: usize,
}

impl DeferredQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            pending: FxHashMap::default(),
            capacity,
        }
    }

    /// Appends to the tail. Hands the entry back if the queue is full or
    /// memory for it cannot be reserved.
    pub fn push(
        &mut self,
        entry: DeferredChecksumEntry,
    ) -> std::result::Result<(), DeferredChecksumEntry> {
        if self.entries.len() >= self.capacity
            || self.entries.try_reserve(1).is_err()
            || self.pending.try_reserve(1).is_err()
        {
            return Err(entry);
        }
        *self.pending.entry(entry.sector).or_insert(0) += 1;
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<DeferredChecksumEntry> {
        let entry = self.entries.pop_front()?;
        if let Some(count) = self.pending.get_mut(&entry.sector) {
            *count -= 1;
            if *count == 0 {
                self.pending.remove(&entry.sector);
            }
        }
        Some(entry)
    }

    pub fn contains_sector(&self, sector: u64) -> bool {
        self.pending.contains_key(&sector)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops everything queued, returning how many entries were lost.
    pub fn discard(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        self.pending.clear();
        n
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeferredChecksumEntry> {
        self.entries.iter()
    }
}
