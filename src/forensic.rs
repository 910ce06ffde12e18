// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Recent-access ring kept for fault reports.

use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumValue;
use crate::types::IoDirection;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub sequence: u64,
    pub sector: u64,
    pub checksum: ChecksumValue,
    pub direction: IoDirection,
}

/// Fixed-capacity ring. Storage is reserved up front so recording never
/// allocates.
#[derive(Debug)]
pub struct AccessLog {
    slots: Vec<AccessRecord>,
    capacity: usize,
    next: usize,
    sequence: u64,
}

impl AccessLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            next: 0,
            sequence: 0,
        }
    }

    pub fn record(&mut self, sector: u64, checksum: ChecksumValue, direction: IoDirection) {
        if self.capacity == 0 {
            return;
        }
        self.sequence += 1;
        let rec = AccessRecord {
            sequence: self.sequence,
            sector,
            checksum,
            direction,
        };
        if self.slots.len() < self.capacity {
            self.slots.push(rec);
        } else {
            self.slots[self.next] = rec;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<AccessRecord> {
        let mut out = Vec::with_capacity(self.slots.len());
        if self.slots.len() < self.capacity {
            out.extend_from_slice(&self.slots);
        } else {
            out.extend_from_slice(&self.slots[self.next..]);
            out.extend_from_slice(&self.slots[..self.next]);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
