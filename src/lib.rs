// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! crcfilter: per-sector checksum verification for a block-device filter.
//!
//! Every sector read or written through the filter is checksummed. Writes
//! store the checksum, reads compare against it. When the checksum table
//! for a sector is not resident the operation is queued and replayed later
//! by a worker that is allowed to block.

pub mod checksum;
pub mod config;
pub mod context;
pub mod deferred;
pub mod engine;
pub mod error;
pub mod fault;
pub mod filter;
pub mod forensic;
pub mod scheduler;
pub mod stats;
pub mod table;
pub mod telemetry;
pub mod types;

pub use checksum::{compute16, compute32, ChecksumValue};
pub use config::{FaultPolicy, FilterConfig};
pub use engine::ChecksumEngine;
pub use error::{FilterError, Result};
pub use fault::{FaultKind, FaultSnapshot};
pub use filter::{BlockTransport, CrcFilter, MemDisk};
pub use types::{IoDirection, IoRequest, RegionIndex, RequestId, SectorRange, VerificationOutcome};

#[cfg(test)]
mod tests;
