// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Addressing and outcome types.

use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};
use crate::fault::FaultKind;

/// Index of a checksum region (`sector / region_sector_count`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RegionIndex(pub u64);

/// Handle of the I/O request that touched a sector, kept for forensics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RequestId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoDirection {
    Read,
    Write,
}

impl IoDirection {
    pub fn is_write(self) -> bool {
        matches!(self, IoDirection::Write)
    }
}

/// Contiguous run of same-sized sectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorRange {
    pub start: u64,
    pub count: u32,
}

impl SectorRange {
    pub fn new(start: u64, count: u32) -> Self {
        Self { start, count }
    }

    /// Builds the range covered by a transfer of `len` bytes starting at `start`.
    /// The length must be a non-zero whole number of sectors.
    pub fn for_transfer(start: u64, len: usize, sector_size: usize) -> Result<Self> {
        if len == 0 {
            return Err(FilterError::InvalidArgument("empty transfer"));
        }
        if len % sector_size != 0 {
            return Err(FilterError::InvalidArgument("transfer is not a whole number of sectors"));
        }
        let count = u32::try_from(len / sector_size)
            .map_err(|_| FilterError::InvalidArgument("transfer too large"))?;
        Self::new(start, count).checked()
    }

    /// Smallest range of whole sectors covering `len` bytes at byte `offset`.
    pub fn covering(offset: u64, len: usize, sector_size: usize) -> Result<Self> {
        if len == 0 {
            return Err(FilterError::InvalidArgument("empty transfer"));
        }
        let ss = sector_size as u64;
        let end = offset
            .checked_add(len as u64)
            .ok_or(FilterError::InvalidArgument("byte range overflows"))?;
        let start = offset / ss;
        let last = (end - 1) / ss;
        let count = u32::try_from(last - start + 1)
            .map_err(|_| FilterError::InvalidArgument("transfer too large"))?;
        Self::new(start, count).checked()
    }

    fn checked(self) -> Result<Self> {
        if self.start.checked_add(self.count as u64).is_none() {
            return Err(FilterError::InvalidArgument("sector range overflows"));
        }
        Ok(self)
    }

    /// One past the last sector.
    pub fn end(&self) -> u64 {
        self.start + self.count as u64
    }

    pub fn last(&self) -> u64 {
        self.end() - 1
    }

    pub fn sectors(&self) -> impl Iterator<Item = u64> {
        self.start..self.end()
    }

    pub fn contains(&self, sector: u64) -> bool {
        sector >= self.start && sector < self.end()
    }
}

/// A read or write the filter has seen complete.
#[derive(Clone, Copy, Debug)]
pub struct IoRequest<'a> {
    pub id: RequestId,
    pub range: SectorRange,
    pub direction: IoDirection,
    pub buffer: &'a [u8],
}

/// Result of checking every sector an I/O touched.
///
/// `FaultRaised` is terminal: the device has latched the fault and refuses
/// further verification. It must never be retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationOutcome {
    Verified,
    /// The check was handed to the drain worker. Also returned when the
    /// deferred queue was full: the check is then dropped, the device is
    /// degraded and `needs_critical_recovery` is set until a recovery pass
    /// wipes the affected regions. Either way the result arrives later, if
    /// at all, as a raised fault.
    Deferred,
    FaultRaised(FaultKind),
}

impl VerificationOutcome {
    /// Folds a per-sector outcome into the running outcome for a whole range.
    pub fn merge(self, next: VerificationOutcome) -> VerificationOutcome {
        match (self, next) {
            (f @ VerificationOutcome::FaultRaised(_), _) => f,
            (_, f @ VerificationOutcome::FaultRaised(_)) => f,
            (VerificationOutcome::Deferred, _) | (_, VerificationOutcome::Deferred) => {
                VerificationOutcome::Deferred
            }
            _ => VerificationOutcome::Verified,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, VerificationOutcome::FaultRaised(_))
    }
}
