// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Read/write interception.
//!
//! `CrcFilter` sits on top of a `BlockTransport` and feeds the checksum
//! engine. Read checksums are compared once the data has arrived; write
//! checksums are stored once the transport reports the write succeeded.
//! A failed write leaves the stored checksums untouched.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::FilterConfig;
use crate::engine::ChecksumEngine;
use crate::error::{FilterError, Result};
use crate::scheduler::WorkScheduler;
use crate::table::RegionPager;
use crate::types::{IoDirection, IoRequest, RequestId, SectorRange, VerificationOutcome};

/// The device below the filter.
pub trait BlockTransport: Send + Sync {
    fn sector_size(&self) -> usize;

    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_sectors(&self, lba: u64, buf: &[u8]) -> io::Result<()>;

    /// Byte-granular write. Transports that cannot do this keep the default.
    fn write_bytes(&self, _offset: u64, _data: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unaligned writes not supported",
        ))
    }
}

pub struct CrcFilter<T> {
    lower: T,
    engine: Arc<ChecksumEngine>,
    next_request: AtomicU64,
}

impl<T: BlockTransport> CrcFilter<T> {
    pub fn attach(
        lower: T,
        config: FilterConfig,
        scheduler: Arc<dyn WorkScheduler>,
        pager: Arc<dyn RegionPager>,
    ) -> Result<Self> {
        if lower.sector_size() != config.sector_size {
            return Err(FilterError::InvalidArgument(
                "configured sector size differs from the device",
            ));
        }
        let engine = ChecksumEngine::new(config, scheduler, pager)?;
        Ok(Self {
            lower,
            engine,
            next_request: AtomicU64::new(1),
        })
    }

    pub fn engine(&self) -> &Arc<ChecksumEngine> {
        &self.engine
    }

    pub fn lower(&self) -> &T {
        &self.lower
    }

    fn next_id(&self) -> RequestId {
        RequestId(self.next_request.fetch_add(1, Ordering::Relaxed))
    }

    fn range_for(&self, lba: u64, len: usize) -> Result<SectorRange> {
        SectorRange::for_transfer(lba, len, self.engine.config().sector_size)
    }

    /// Reads whole sectors and verifies them against their stored checksums.
    pub fn read(&self, lba: u64, buf: &mut [u8]) -> Result<VerificationOutcome> {
        let range = self.range_for(lba, buf.len())?;
        self.lower.read_sectors(lba, buf)?;
        self.engine.on_io_range_touched(&IoRequest {
            id: self.next_id(),
            range,
            direction: IoDirection::Read,
            buffer: buf,
        })
    }

    /// Writes whole sectors and records their checksums.
    pub fn write(&self, lba: u64, buf: &[u8]) -> Result<VerificationOutcome> {
        let range = self.range_for(lba, buf.len())?;
        self.lower.write_sectors(lba, buf)?;
        self.engine.on_io_range_touched(&IoRequest {
            id: self.next_id(),
            range,
            direction: IoDirection::Write,
            buffer: buf,
        })
    }

    /// Byte-granular write. Aligned writes take the normal path; otherwise
    /// every touched sector's checksum is invalidated.
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<VerificationOutcome> {
        let ss = self.engine.config().sector_size;
        if offset % ss as u64 == 0 && data.len() % ss == 0 && !data.is_empty() {
            return self.write(offset / ss as u64, data);
        }
        let range = SectorRange::covering(offset, data.len(), ss)?;
        self.lower.write_bytes(offset, data)?;
        self.engine.invalidate_range(range)?;
        Ok(VerificationOutcome::Verified)
    }

    /// Drains outstanding checksum work and releases the checksum table.
    pub fn detach(&self) -> Result<()> {
        self.engine.teardown()
    }
}

/// RAM-backed transport. Also lets tests corrupt data behind the filter.
#[derive(Debug)]
pub struct MemDisk {
    sector_size: usize,
    data: RwLock<Vec<u8>>,
}

impl MemDisk {
    pub fn new(sector_size: usize, sectors: u64) -> Self {
        Self {
            sector_size,
            data: RwLock::new(vec![0u8; sector_size * sectors as usize]),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn span(&self, offset: u64, len: usize, total: usize) -> io::Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        match start.checked_add(len) {
            Some(end) if end <= total => Ok(start..end),
            _ => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "access beyond end of device",
            )),
        }
    }

    fn byte_offset(&self, lba: u64) -> io::Result<u64> {
        lba.checked_mul(self.sector_size as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "lba too large"))
    }

    /// Flips one bit without going through the filter.
    pub fn flip_bit(&self, byte_offset: u64, bit: u8) -> io::Result<()> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let total = data.len();
        let span = self.span(byte_offset, 1, total)?;
        data[span.start] ^= 1 << (bit % 8);
        Ok(())
    }
}

impl BlockTransport for MemDisk {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let span = self.span(self.byte_offset(lba)?, buf.len(), data.len())?;
        buf.copy_from_slice(&data[span]);
        Ok(())
    }

    fn write_sectors(&self, lba: u64, buf: &[u8]) -> io::Result<()> {
        self.write_bytes(self.byte_offset(lba)?, buf)
    }

    fn write_bytes(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let total = data.len();
        let span = self.span(offset, buf.len(), total)?;
        data[span].copy_from_slice(buf);
        Ok(())
    }
}

impl<B: BlockTransport + ?Sized> BlockTransport for Arc<B> {
    fn sector_size(&self) -> usize {
        (**self).sector_size()
    }

    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_sectors(lba, buf)
    }

    fn write_sectors(&self, lba: u64, buf: &[u8]) -> io::Result<()> {
        (**self).write_sectors(lba, buf)
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_bytes(offset, data)
    }
}
