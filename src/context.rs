// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Execution-context markers.
//!
//! Code reachable from I/O submission or completion runs in the elevated
//! context: it may take the fast lock but must not block, allocate checksum
//! memory or page anything in. Anything that may block takes a `&Worker`.
//! Only the drain worker, the recovery pass and the host's blocking entry
//! points (`make_resident`, `evict_region`, `teardown`) can create one.

use std::marker::PhantomData;

/// Proof that the current thread may block.
///
/// Not `Send`: a token cannot be handed to a thread that did not create it.
#[derive(Debug)]
pub struct Worker {
    _not_send: PhantomData<*const ()>,
}

impl Worker {
    pub(crate) fn enter() -> Self {
        Worker {
            _not_send: PhantomData,
        }
    }
}
