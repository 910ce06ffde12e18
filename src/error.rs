// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    /// Range not sector aligned, bad configuration, or a malformed request.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Sector maps to a region beyond the configured table bound.
    #[error("Sector {sector} maps to region {region}, beyond the configured {max_regions} regions")]
    OutOfRange {
        sector: u64,
        region: u64,
        max_regions: u64,
    },
    /// Allocation or pinning of checksum memory failed.
    #[error("Out of resources: {0}")]
    OutOfResources(&'static str),
    /// Teardown gave up with work still queued.
    #[error("{remaining} deferred checksum operations still pending")]
    PendingWorkRemaining { remaining: usize },
    /// The filter has been torn down.
    #[error("Filter is detached")]
    Detached,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FilterError>;
