// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{sync::CompletionSignal, txn::TxnIndex};
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicBool, Ordering};

/// Per-transaction status shared between workers while a block executes. Table entries refer to
/// transactions by `TxnIndex` into the block's arena rather than by pointer.
pub struct TxnSlot<S> {
    aborted: AtomicBool,
    committed: CompletionSignal,
    pub state: S,
}

impl<S> TxnSlot<S> {
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn clear_aborted(&self) {
        self.aborted.store(false, Ordering::Release);
    }

    pub fn committed(&self) -> &CompletionSignal {
        &self.committed
    }
}

/// Status slots of every transaction of one block. Lives exactly as long as the block's
/// execution.
pub struct BlockArena<S> {
    batch_id: u64,
    slots: Vec<CachePadded<TxnSlot<S>>>,
}

impl<S> BlockArena<S> {
    pub fn new(batch_id: u64, num_txns: usize, init: impl Fn(TxnIndex) -> S) -> Self {
        let slots = (0..num_txns)
            .map(|idx| {
                CachePadded::new(TxnSlot {
                    aborted: AtomicBool::new(false),
                    committed: CompletionSignal::new(),
                    state: init(idx),
                })
            })
            .collect();
        Self { batch_id, slots }
    }

    /// Monotonic id of the block this arena belongs to (block position + 1).
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    pub fn slot(&self, idx: TxnIndex) -> &TxnSlot<S> {
        &self.slots[idx]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
