// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! A single checksum region: primary and shadow arrays for a run of sectors.

use crate::checksum::ChecksumValue;
use crate::error::{FilterError, Result};
use crate::types::RegionIndex;

/// Primary and shadow disagree for a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShadowMismatch {
    pub primary: ChecksumValue,
    pub shadow: ChecksumValue,
}

#[derive(Debug)]
pub struct ChecksumRegion {
    index: RegionIndex,
    primary: Box<[ChecksumValue]>,
    shadow: Box<[ChecksumValue]>,
    resident: bool,
    last_access: u64,
}

fn zeroed(len: usize) -> Result<Box<[ChecksumValue]>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| FilterError::OutOfResources("checksum region allocation"))?;
    v.resize(len, ChecksumValue::UNKNOWN);
    Ok(v.into_boxed_slice())
}

impl ChecksumRegion {
    /// Allocates a region with every slot at the sentinel. Not resident yet.
    pub fn allocate(index: RegionIndex, sectors: usize) -> Result<Self> {
        Ok(Self {
            index,
            primary: zeroed(sectors)?,
            shadow: zeroed(sectors)?,
            resident: false,
            last_access: 0,
        })
    }

    pub fn index(&self) -> RegionIndex {
        self.index
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    pub fn is_resident(&self) -> bool {
        self.resident
    }

    pub(crate) fn set_resident(&mut self, resident: bool) {
        self.resident = resident;
    }

    pub fn last_access(&self) -> u64 {
        self.last_access
    }

    pub(crate) fn touch(&mut self, now: u64) {
        self.last_access = now;
    }

    /// Reads a slot, checking it against its shadow.
    pub fn read_entry(&self, offset: usize) -> std::result::Result<ChecksumValue, ShadowMismatch> {
        let primary = self.primary[offset];
        let shadow = self.shadow[offset];
        if primary != shadow {
            return Err(ShadowMismatch { primary, shadow });
        }
        Ok(primary)
    }

    pub fn write_entry(&mut self, offset: usize, value: ChecksumValue) {
        self.primary[offset] = value;
        self.shadow[offset] = value;
    }

    /// Resets every slot to the sentinel.
    pub fn clear(&mut self) {
        self.primary.fill(ChecksumValue::UNKNOWN);
        self.shadow.fill(ChecksumValue::UNKNOWN);
    }

    #[cfg(test)]
    pub(crate) fn tamper_shadow(&mut self, offset: usize, value: ChecksumValue) {
        self.shadow[offset] = value;
    }
}
