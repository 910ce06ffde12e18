// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Making region memory resident.
//!
//! The filter does not know how the host pins memory. A `RegionPager` is
//! asked to pin a region's arrays before elevated code may touch them and
//! told when they are released again. Both calls happen with the residency
//! lock held and never from the elevated context.

use crate::error::Result;
use crate::types::RegionIndex;

pub trait RegionPager: Send + Sync {
    /// Pin `bytes` of checksum memory for `region`. May block.
    fn pin(&self, region: RegionIndex, bytes: usize) -> Result<()>;

    /// Release a previously pinned region.
    fn unpin(&self, region: RegionIndex);
}

/// Heap memory is always resident; pinning is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPager;

impl RegionPager for NoopPager {
    fn pin(&self, _region: RegionIndex, _bytes: usize) -> Result<()> {
        Ok(())
    }

    fn unpin(&self, _region: RegionIndex) {}
}
