// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Running deferred work outside the elevated context.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::error::{FilterError, Result};

pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Runs a callback later, on a thread that may block.
pub trait WorkScheduler: Send + Sync {
    fn schedule(&self, work: Work) -> Result<()>;
}

/// One short-lived OS thread per scheduled item.
#[derive(Debug, Clone)]
pub struct ThreadScheduler {
    name: String,
}

impl ThreadScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new("crcfilter-drain")
    }
}

impl WorkScheduler for ThreadScheduler {
    fn schedule(&self, work: Work) -> Result<()> {
        std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(work)
            .map(|_| ())
            .map_err(|e| {
                tracing::warn!("failed to spawn drain thread: {}", e);
                FilterError::OutOfResources("drain thread")
            })
    }
}

/// Holds scheduled work until the host runs it.
///
/// For hosts that drive their own event loop, and for tests that need to
/// control exactly when the drain worker runs.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<Work>>,
    scheduled: AtomicUsize,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of `schedule` calls so far.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Runs queued work, including anything scheduled while running, and
    /// returns how many items ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match next {
                Some(work) => {
                    work();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl WorkScheduler for ManualScheduler {
    fn schedule(&self, work: Work) -> Result<()> {
        self.scheduled.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(work);
        Ok(())
    }
}
