// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Checksum table store.
//!
//! Sparse map from region index to `ChecksumRegion`. Lives inside the
//! device state behind the fast lock, so every method here is O(1) (apart
//! from eviction victim selection, which only the worker context calls)
//! and never blocks. Regions are allocated and pinned by the engine from
//! worker context and installed here afterwards.

pub mod pager;
pub mod region;

use rustc_hash::FxHashMap;

use crate::checksum::ChecksumValue;
use crate::config::FilterConfig;
use crate::error::{FilterError, Result};
use crate::types::RegionIndex;

pub use pager::{NoopPager, RegionPager};
pub use region::{ChecksumRegion, ShadowMismatch};

/// Sector to region arithmetic. Needs no lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub region_sector_count: u64,
    pub max_regions: u64,
}

impl Geometry {
    pub fn from_config(config: &FilterConfig) -> Self {
        Self {
            region_sector_count: config.region_sector_count,
            max_regions: config.max_regions,
        }
    }

    pub fn region_for(&self, sector: u64) -> Result<RegionIndex> {
        let region = sector / self.region_sector_count;
        if region >= self.max_regions {
            return Err(FilterError::OutOfRange {
                sector,
                region,
                max_regions: self.max_regions,
            });
        }
        Ok(RegionIndex(region))
    }

    pub fn offset_in_region(&self, sector: u64) -> usize {
        (sector % self.region_sector_count) as usize
    }
}

/// Whether a region can be touched from the elevated context right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    Resident,
    NeedsDefer,
}

/// Why a slot access could not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotError {
    NotResident,
    Corrupt(ShadowMismatch),
}

#[derive(Debug)]
pub struct ChecksumTable {
    regions: FxHashMap<u64, ChecksumRegion>,
    resident: usize,
    clock: u64,
}

impl ChecksumTable {
    pub fn new() -> Self {
        Self {
            regions: FxHashMap::default(),
            resident: 0,
            clock: 0,
        }
    }

    /// Non-blocking residency check. Marks the region as recently used.
    pub fn check_resident(&mut self, region: RegionIndex) -> Residency {
        self.clock += 1;
        let now = self.clock;
        match self.regions.get_mut(&region.0) {
            Some(r) if r.is_resident() => {
                r.touch(now);
                Residency::Resident
            }
            _ => Residency::NeedsDefer,
        }
    }

    pub fn is_allocated(&self, region: RegionIndex) -> bool {
        self.regions.contains_key(&region.0)
    }

    pub fn is_resident(&self, region: RegionIndex) -> bool {
        self.regions.get(&region.0).is_some_and(|r| r.is_resident())
    }

    pub fn resident_count(&self) -> usize {
        self.resident
    }

    pub fn allocated_count(&self) -> usize {
        self.regions.len()
    }

    pub fn allocated_regions(&self) -> Vec<RegionIndex> {
        let mut v: Vec<RegionIndex> = self.regions.keys().map(|&k| RegionIndex(k)).collect();
        v.sort_unstable();
        v
    }

    fn resident_region(&self, region: RegionIndex) -> std::result::Result<&ChecksumRegion, SlotError> {
        match self.regions.get(&region.0) {
            Some(r) if r.is_resident() => Ok(r),
            _ => Err(SlotError::NotResident),
        }
    }

    fn resident_region_mut(
        &mut self,
        region: RegionIndex,
    ) -> std::result::Result<&mut ChecksumRegion, SlotError> {
        match self.regions.get_mut(&region.0) {
            Some(r) if r.is_resident() => Ok(r),
            _ => Err(SlotError::NotResident),
        }
    }

    pub fn read_entry(
        &self,
        region: RegionIndex,
        offset: usize,
    ) -> std::result::Result<ChecksumValue, SlotError> {
        self.resident_region(region)?
            .read_entry(offset)
            .map_err(SlotError::Corrupt)
    }

    pub fn write_entry(
        &mut self,
        region: RegionIndex,
        offset: usize,
        value: ChecksumValue,
    ) -> std::result::Result<(), SlotError> {
        self.resident_region_mut(region)?.write_entry(offset, value);
        Ok(())
    }

    /// Resets a resident region to the sentinel.
    pub fn clear_region(&mut self, region: RegionIndex) -> std::result::Result<(), SlotError> {
        self.resident_region_mut(region)?.clear();
        Ok(())
    }

    /// Adds a freshly allocated region. An existing region is kept.
    pub fn install(&mut self, region: ChecksumRegion) {
        self.regions.entry(region.index().0).or_insert(region);
    }

    pub fn mark_resident(&mut self, region: RegionIndex) -> bool {
        self.clock += 1;
        let now = self.clock;
        match self.regions.get_mut(&region.0) {
            Some(r) => {
                if !r.is_resident() {
                    r.set_resident(true);
                    self.resident += 1;
                }
                r.touch(now);
                true
            }
            None => false,
        }
    }

    /// Marks a region paged out. Its contents survive but may not be
    /// touched until it is made resident again.
    pub fn mark_paged_out(&mut self, region: RegionIndex) -> bool {
        match self.regions.get_mut(&region.0) {
            Some(r) if r.is_resident() => {
                r.set_resident(false);
                self.resident -= 1;
                true
            }
            _ => false,
        }
    }

    /// Least recently used resident region other than `keep`.
    pub fn lru_victim(&self, keep: RegionIndex) -> Option<RegionIndex> {
        self.regions
            .values()
            .filter(|r| r.is_resident() && r.index() != keep)
            .min_by_key(|r| (r.last_access(), r.index()))
            .map(|r| r.index())
    }

    /// Drops every region.
    pub fn release_all(&mut self) -> Vec<RegionIndex> {
        let pinned = self
            .regions
            .values()
            .filter(|r| r.is_resident())
            .map(|r| r.index())
            .collect();
        self.regions.clear();
        self.resident = 0;
        pinned
    }

    #[cfg(test)]
    pub(crate) fn region_mut(&mut self, region: RegionIndex) -> Option<&mut ChecksumRegion> {
        self.regions.get_mut(&region.0)
    }
}

impl Default for ChecksumTable {
    fn default() -> Self {
        Self::new()
    }
}
