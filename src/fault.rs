// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Consistency faults.
//!
//! A fault is raised exactly once per device: the first capture is kept,
//! the device stops verifying, and depending on `FaultPolicy` the
//! component either halts or latches `FaultRaised` for every later check.
//! Faults are never returned as `FilterError`s and never retried.

use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumValue;
use crate::config::FaultPolicy;
use crate::forensic::AccessRecord;
use crate::types::RequestId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// Data read back does not match the checksum stored when it was written.
    DataMismatch,
    /// Primary and shadow copies of a stored checksum disagree.
    MetadataCorruption,
}

impl FaultKind {
    /// Diagnostic code reported with the stop.
    pub fn code(self) -> u32 {
        match self {
            FaultKind::DataMismatch => 0xC8C0_0001,
            FaultKind::MetadataCorruption => 0xC8C0_0002,
        }
    }
}

/// State captured at the moment a fault is raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSnapshot {
    pub kind: FaultKind,
    pub sector: u64,
    pub request: Option<RequestId>,
    /// Raised inline with the I/O rather than by the drain worker.
    pub synchronous: bool,
    /// Stored value (primary copy for metadata corruption).
    pub expected: ChecksumValue,
    /// Computed value (shadow copy for metadata corruption).
    pub found: ChecksumValue,
}

/// Snapshot plus the access history leading up to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultReport {
    pub code: u32,
    pub snapshot: FaultSnapshot,
    pub recent: Vec<AccessRecord>,
}

impl FaultReport {
    pub fn new(snapshot: FaultSnapshot, recent: Vec<AccessRecord>) -> Self {
        Self {
            code: snapshot.kind.code(),
            snapshot,
            recent,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Logs a freshly captured fault and applies the policy.
///
/// Must be called with no lock held: under `FaultPolicy::Halt` it does
/// not return.
pub(crate) fn report(snapshot: &FaultSnapshot, policy: FaultPolicy) {
    metrics::increment_counter!("crcfilter_faults_total");
    tracing::error!(
        code = snapshot.kind.code(),
        sector = snapshot.sector,
        request = snapshot.request.map_or(0, |r| r.0),
        synchronous = snapshot.synchronous,
        expected = snapshot.expected.0,
        found = snapshot.found.0,
        "checksum fault: {:?}",
        snapshot.kind
    );
    if policy == FaultPolicy::Halt {
        panic!(
            "crcfilter: {:?} (code {:#010x}) at sector {}",
            snapshot.kind,
            snapshot.kind.code(),
            snapshot.sector
        );
    }
}
