// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Filter configuration.

use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};

/// What happens once a checksum fault has been captured.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultPolicy {
    /// Panic after capture. With `panic = "abort"` this stops the process.
    Halt,
    /// Keep the capture and refuse every later check with `FaultRaised`.
    Latch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Bytes per sector. Power of two, at least 512.
    pub sector_size: usize,
    /// Sectors whose checksums share one region (one page of u16 entries).
    pub region_sector_count: u64,
    /// Upper bound on the region table.
    pub max_regions: u64,
    /// Resident regions before the least recently used is paged out. 0 = unbounded.
    pub max_resident_regions: usize,
    /// Deferred entries before an enqueue counts as resource exhaustion.
    pub max_deferred_entries: usize,
    /// Length of the recent-access ring kept for fault reports.
    pub forensic_log_len: usize,
    /// Record the computed checksum when a read finds nothing stored.
    pub learn_on_first_read: bool,
    pub fault_policy: FaultPolicy,
    /// How long teardown waits for the deferred queue to drain.
    pub teardown_timeout_ms: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            sector_size: 512,
            region_sector_count: 2048,
            max_regions: 1 << 20,
            max_resident_regions: 0,
            max_deferred_entries: 65536,
            forensic_log_len: 64,
            learn_on_first_read: true,
            fault_policy: FaultPolicy::Halt,
            teardown_timeout_ms: 5000,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.sector_size < 512 || !self.sector_size.is_power_of_two() {
            return Err(FilterError::InvalidArgument("sector size must be a power of two >= 512"));
        }
        if self.region_sector_count == 0 {
            return Err(FilterError::InvalidArgument("region must hold at least one sector"));
        }
        if usize::try_from(self.region_sector_count).is_err() {
            return Err(FilterError::InvalidArgument("region too large"));
        }
        if self.max_regions == 0 {
            return Err(FilterError::InvalidArgument("max_regions must be non-zero"));
        }
        Ok(())
    }

    /// Bytes of checksum memory one region pins (primary and shadow).
    pub fn region_bytes(&self) -> usize {
        self.region_sector_count as usize * 2 * std::mem::size_of::<u16>()
    }

    pub fn teardown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.teardown_timeout_ms)
    }
}
