// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Sector checksums.
//!
//! CRC-32 (ISO 3309, reflected polynomial `0xEDB88320`) folded to 16 bits.
//! Pre- and post-conditioning with `0xFFFFFFFF` is done here: callers pass
//! `0` as `partial` for a fresh computation, or a previous raw result to
//! continue one. A checksum of `0` is reserved to mean "nothing recorded",
//! so a computation that lands on `0` reports `1` instead.

use serde::{Deserialize, Serialize};

/// Stored per-sector checksum. `0` is the "no checksum recorded" sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ChecksumValue(pub u16);

impl ChecksumValue {
    /// Nothing recorded for the sector; never compared.
    pub const UNKNOWN: ChecksumValue = ChecksumValue(0);

    /// Checksum of one sector's worth of data.
    pub fn of(buffer: &[u8]) -> Self {
        ChecksumValue(compute16(0, buffer))
    }

    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }
}

fn raw_crc32(partial: u32, buffer: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(partial);
    hasher.update(buffer);
    hasher.finalize()
}

fn nonzero32(crc: u32) -> u32 {
    if crc == 0 {
        1
    } else {
        crc
    }
}

fn fold16(crc: u32) -> u16 {
    match ((crc >> 16) ^ (crc & 0xFFFF)) as u16 {
        0 => 1,
        folded => folded,
    }
}

/// CRC-32 of `buffer`, continuing from `partial`. Never returns `0`.
pub fn compute32(partial: u32, buffer: &[u8]) -> u32 {
    nonzero32(raw_crc32(partial, buffer))
}

/// CRC-32 of `buffer` folded to 16 bits as `(crc >> 16) ^ (crc & 0xFFFF)`.
/// Never returns `0`.
pub fn compute16(partial: u32, buffer: &[u8]) -> u16 {
    fold16(raw_crc32(partial, buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        assert_eq!(compute32(0, b"123456789"), 0xCBF4_3926);
        let crc = 0xCBF4_3926u32;
        assert_eq!(compute16(0, b"123456789"), ((crc >> 16) ^ (crc & 0xFFFF)) as u16);
    }

    #[test]
    fn test_continuation() {
        let whole = compute32(0, b"hello world");
        let first = compute32(0, b"hello ");
        assert_eq!(compute32(first, b"world"), whole);
    }

    #[test]
    fn test_zero_results_are_remapped() {
        assert_eq!(nonzero32(0), 1);
        assert_eq!(nonzero32(7), 7);
        assert_eq!(fold16(0x1234_1234), 1);
        assert_eq!(fold16(0), 1);
        assert_eq!(fold16(0x0001_0000), 1);
        assert_eq!(fold16(0x0001_0003), 2);
    }

    #[test]
    fn test_empty_buffer() {
        // CRC of nothing is 0 and must come back as the first valid value.
        assert_eq!(compute32(0, &[]), 1);
        assert_eq!(compute16(0, &[]), 1);
    }
}
