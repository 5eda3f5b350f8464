// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::{BatchContext, ConflictPolicy, PhasedTransaction};
use crate::{arena::BlockArena, protocol::Partitioning, txn::TxnIndex};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// Readers and writers of one key during one batch.
#[derive(Debug, Default)]
pub struct HarmonyReservation {
    batch_id: u64,
    readers: Vec<TxnIndex>,
    writers: Vec<TxnIndex>,
}

impl HarmonyReservation {
    fn reset_if_stale(&mut self, batch_id: u64) {
        if self.batch_id != batch_id {
            self.batch_id = batch_id;
            self.readers.clear();
            self.writers.clear();
        }
    }
}

/// Ordering bounds of one transaction, tightened as read-write dependencies are observed.
///
/// `min_out` is the smallest writer whose write this transaction failed to observe (it must be
/// ordered before that writer). `max_in` is the largest reader that failed to observe this
/// transaction's write (that reader must be ordered before this transaction).
pub struct HarmonyOrder {
    min_out: AtomicUsize,
    // Stored as reader index + 1, 0 meaning no incoming dependency.
    max_in: AtomicUsize,
}

impl HarmonyOrder {
    pub fn new(index: TxnIndex) -> Self {
        Self {
            min_out: AtomicUsize::new(index + 1),
            max_in: AtomicUsize::new(0),
        }
    }

    pub fn min_out(&self) -> TxnIndex {
        self.min_out.load(Ordering::Acquire)
    }

    pub fn max_in(&self) -> Option<TxnIndex> {
        self.max_in.load(Ordering::Acquire).checked_sub(1)
    }

    /// A transaction must fall back if it has to precede a smaller writer while some reader at or
    /// after that writer has to precede it.
    pub fn must_fall_back(&self, index: TxnIndex) -> bool {
        let min_out = self.min_out();
        min_out < index && self.max_in().is_some_and(|max_in| min_out <= max_in)
    }
}

/// Records that `reader` did not observe `writer`'s write.
pub fn on_seeing_rw_dependency(
    arena: &BlockArena<HarmonyOrder>,
    writer: TxnIndex,
    reader: TxnIndex,
) {
    if writer == reader {
        return;
    }
    arena
        .slot(reader)
        .state
        .min_out
        .fetch_min(writer, Ordering::AcqRel);
    arena
        .slot(writer)
        .state
        .max_in
        .fetch_max(reader + 1, Ordering::AcqRel);
}

/// Harmony: track every read-write pair while executing, commit in place all transactions whose
/// ordering bounds are consistent, with the highest writer of a key winning.
///
/// Blocks always run one at a time; the inter-block flag is only reported.
pub struct HarmonyPolicy;

impl HarmonyPolicy {
    pub fn new(enable_inter_block: bool) -> Self {
        if enable_inter_block {
            info!("harmony inter-block mode requested, blocks still execute one at a time");
        }
        Self
    }
}

impl ConflictPolicy for HarmonyPolicy {
    type Reservation = HarmonyReservation;
    type TxnState = HarmonyOrder;

    const NAME: &'static str = "Harmony";
    const PARTITIONING: Partitioning = Partitioning::Contiguous;
    const TRACKS_ACCESSES: bool = true;

    fn init_state(&self, index: TxnIndex) -> HarmonyOrder {
        HarmonyOrder::new(index)
    }

    fn on_read(
        &self,
        arena: &BlockArena<HarmonyOrder>,
        reader: TxnIndex,
        reservation: &mut HarmonyReservation,
    ) {
        reservation.reset_if_stale(arena.batch_id());
        for &writer in &reservation.writers {
            on_seeing_rw_dependency(arena, writer, reader);
        }
        reservation.readers.push(reader);
    }

    fn on_write(
        &self,
        arena: &BlockArena<HarmonyOrder>,
        writer: TxnIndex,
        reservation: &mut HarmonyReservation,
    ) {
        reservation.reset_if_stale(arena.batch_id());
        for &reader in &reservation.readers {
            on_seeing_rw_dependency(arena, writer, reader);
        }
        reservation.writers.push(writer);
    }

    fn has_conflict(&self, ctx: &BatchContext<'_, Self>, txn: &PhasedTransaction) -> bool {
        ctx.arena()
            .slot(txn.index())
            .state
            .must_fall_back(txn.index())
    }
}
