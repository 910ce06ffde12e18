// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::config::{FaultPolicy, FilterConfig};
use crate::engine::ChecksumEngine;
use crate::error::{FilterError, Result};
use crate::scheduler::{ManualScheduler, Work, WorkScheduler};
use crate::table::RegionPager;
use crate::types::{IoDirection, IoRequest, RegionIndex, RequestId, SectorRange};

pub mod engine_tests;

/// Eight sectors per region keeps region arithmetic easy to follow.
pub(crate) fn test_config() -> FilterConfig {
    FilterConfig {
        region_sector_count: 8,
        max_regions: 64,
        fault_policy: FaultPolicy::Latch,
        teardown_timeout_ms: 200,
        ..FilterConfig::default()
    }
}

pub(crate) fn setup(cfg: FilterConfig) -> (Arc<ChecksumEngine>, Arc<ManualScheduler>) {
    let sched = Arc::new(ManualScheduler::new());
    let engine = ChecksumEngine::with_scheduler(cfg, sched.clone()).unwrap();
    (engine, sched)
}

pub(crate) fn sector_of(fill: u8) -> Vec<u8> {
    vec![fill; 512]
}

pub(crate) fn request(id: u64, start: u64, direction: IoDirection, buffer: &[u8]) -> IoRequest<'_> {
    IoRequest {
        id: RequestId(id),
        range: SectorRange::new(start, (buffer.len() / 512) as u32),
        direction,
        buffer,
    }
}

/// Make the region holding `sector` resident without draining anything.
pub(crate) fn warm(engine: &ChecksumEngine, sector: u64) {
    engine.make_resident(SectorRange::new(sector, 1)).unwrap();
}

/// Pager whose pin can be switched to fail.
#[derive(Default)]
pub(crate) struct FlakyPager {
    pub fail: AtomicBool,
}

impl RegionPager for FlakyPager {
    fn pin(&self, _region: RegionIndex, _bytes: usize) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FilterError::OutOfResources("pin refused"));
        }
        Ok(())
    }

    fn unpin(&self, _region: RegionIndex) {}
}

type PinHook = Box<dyn FnOnce(&ChecksumEngine) + Send>;

/// Pager that runs a one-shot hook against the engine on the next pin, the
/// way a concurrent I/O would land while the worker blocks in the pager.
#[derive(Default)]
pub(crate) struct HookPager {
    engine: Mutex<Weak<ChecksumEngine>>,
    hook: Mutex<Option<PinHook>>,
}

impl HookPager {
    pub fn bind(&self, engine: &Arc<ChecksumEngine>) {
        *self.engine.lock().unwrap() = Arc::downgrade(engine);
    }

    pub fn arm(&self, hook: impl FnOnce(&ChecksumEngine) + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }
}

impl RegionPager for HookPager {
    fn pin(&self, _region: RegionIndex, _bytes: usize) -> Result<()> {
        let hook = self.hook.lock().unwrap().take();
        if let Some(hook) = hook {
            let engine = self.engine.lock().unwrap().upgrade();
            if let Some(engine) = engine {
                hook(&engine);
            }
        }
        Ok(())
    }

    fn unpin(&self, _region: RegionIndex) {}
}

/// Scheduler that never accepts work.
pub(crate) struct RefusingScheduler;

impl WorkScheduler for RefusingScheduler {
    fn schedule(&self, _work: Work) -> Result<()> {
        Err(FilterError::OutOfResources("no workers"))
    }
}
