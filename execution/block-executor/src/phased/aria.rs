// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use super::{BatchContext, ConflictPolicy, PhasedTransaction};
use crate::{protocol::Partitioning, txn::TxnIndex};

/// Smallest-id-wins read and write reservations of one key, valid only for the batch they were
/// taken in. A reservation from an older batch is treated as absent and overwritten on touch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AriaReservation {
    get_batch: u64,
    get: Option<TxnIndex>,
    put_batch: u64,
    put: Option<TxnIndex>,
}

impl AriaReservation {
    pub fn reserve_get(&mut self, batch_id: u64, idx: TxnIndex) {
        if self.get_batch != batch_id || self.get.is_none_or(|holder| idx < holder) {
            self.get_batch = batch_id;
            self.get = Some(idx);
        }
    }

    pub fn reserve_put(&mut self, batch_id: u64, idx: TxnIndex) {
        if self.put_batch != batch_id || self.put.is_none_or(|holder| idx < holder) {
            self.put_batch = batch_id;
            self.put = Some(idx);
        }
    }

    /// Like `reserve_put`, but also takes the reservation over from an aborted holder.
    pub fn reserve_put_again(
        &mut self,
        batch_id: u64,
        idx: TxnIndex,
        is_aborted: impl Fn(TxnIndex) -> bool,
    ) {
        if self.put_batch != batch_id
            || self
                .put
                .is_none_or(|holder| idx < holder || (holder != idx && is_aborted(holder)))
        {
            self.put_batch = batch_id;
            self.put = Some(idx);
        }
    }

    /// True if no transaction ordered before `idx` holds the read reservation.
    pub fn compare_get(&self, batch_id: u64, idx: TxnIndex) -> bool {
        self.get_batch != batch_id || self.get.is_none_or(|holder| holder >= idx)
    }

    /// True if no transaction ordered before `idx` holds the write reservation.
    pub fn compare_put(&self, batch_id: u64, idx: TxnIndex) -> bool {
        self.put_batch != batch_id || self.put.is_none_or(|holder| holder >= idx)
    }

    /// Like `compare_put`, ignoring a holder that was aborted.
    pub fn compare_put_unless_aborted(
        &self,
        batch_id: u64,
        idx: TxnIndex,
        is_aborted: impl Fn(TxnIndex) -> bool,
    ) -> bool {
        self.put_batch != batch_id
            || self
                .put
                .is_none_or(|holder| holder >= idx || is_aborted(holder))
    }
}

fn decide(enable_reordering: bool, raw: bool, war: bool, waw: bool) -> bool {
    if enable_reordering {
        waw || (raw && war)
    } else {
        waw || raw
    }
}

/// Aria: reserve everything after execution, verify once.
pub struct AriaPolicy {
    enable_reordering: bool,
}

impl AriaPolicy {
    pub fn new(enable_reordering: bool) -> Self {
        Self { enable_reordering }
    }
}

impl ConflictPolicy for AriaPolicy {
    type Reservation = AriaReservation;
    type TxnState = ();

    const NAME: &'static str = "Aria";
    const PARTITIONING: Partitioning = Partitioning::Contiguous;

    fn init_state(&self, _index: TxnIndex) {}

    fn reserve(&self, ctx: &BatchContext<'_, Self>, txn: &PhasedTransaction) {
        let batch_id = ctx.batch_id();
        for key in txn.rw().read_keys() {
            ctx.with_reservation(key, |r| r.reserve_get(batch_id, txn.index()));
        }
        for key in txn.rw().write_keys() {
            ctx.with_reservation(key, |r| r.reserve_put(batch_id, txn.index()));
        }
    }

    fn has_conflict(&self, ctx: &BatchContext<'_, Self>, txn: &PhasedTransaction) -> bool {
        let (batch_id, idx) = (ctx.batch_id(), txn.index());
        let raw = txn
            .rw()
            .read_keys()
            .any(|key| !ctx.with_reservation(key, |r| r.compare_put(batch_id, idx)));
        let war = txn
            .rw()
            .write_keys()
            .any(|key| !ctx.with_reservation(key, |r| r.compare_get(batch_id, idx)));
        let waw = txn
            .rw()
            .write_keys()
            .any(|key| !ctx.with_reservation(key, |r| r.compare_put(batch_id, idx)));
        decide(self.enable_reordering, raw, war, waw)
    }
}

/// AriaER: write reservations first, an early write-after-write check, then read reservations
/// taken only by the survivors so that doomed transactions do not cause spurious conflicts.
///
/// Round 0 checks write-after-write against the write reservations alone. Abort flags set by
/// round 0 become visible from round 1 on, so the outcome does not depend on which worker gets
/// to a transaction first.
pub struct AriaErPolicy {
    enable_reordering: bool,
}

impl AriaErPolicy {
    pub fn new(enable_reordering: bool) -> Self {
        Self { enable_reordering }
    }
}

const VERIFY_WRITE_ROUND: usize = 0;
const RESERVE_READ_ROUND: usize = 1;

impl ConflictPolicy for AriaErPolicy {
    type Reservation = AriaReservation;
    type TxnState = ();

    const NAME: &'static str = "AriaER";
    const PARTITIONING: Partitioning = Partitioning::RoundRobin;
    const ROUNDS: usize = 2;

    fn init_state(&self, _index: TxnIndex) {}

    fn reserve(&self, ctx: &BatchContext<'_, Self>, txn: &PhasedTransaction) {
        let batch_id = ctx.batch_id();
        for key in txn.rw().write_keys() {
            ctx.with_reservation(key, |r| r.reserve_put(batch_id, txn.index()));
        }
    }

    fn run_round(&self, round: usize, ctx: &BatchContext<'_, Self>, txn: &PhasedTransaction) -> bool {
        let (batch_id, idx) = (ctx.batch_id(), txn.index());
        match round {
            VERIFY_WRITE_ROUND => txn
                .rw()
                .write_keys()
                .any(|key| !ctx.with_reservation(key, |r| r.compare_put(batch_id, idx))),
            RESERVE_READ_ROUND => {
                let arena = ctx.arena();
                for key in txn.rw().read_keys() {
                    ctx.with_reservation(key, |r| r.reserve_get(batch_id, idx));
                }
                for key in txn.rw().write_keys() {
                    ctx.with_reservation(key, |r| {
                        r.reserve_put_again(batch_id, idx, |holder| arena.slot(holder).is_aborted())
                    });
                }
                false
            },
            _ => false,
        }
    }

    fn has_conflict(&self, ctx: &BatchContext<'_, Self>, txn: &PhasedTransaction) -> bool {
        let (batch_id, idx) = (ctx.batch_id(), txn.index());
        let arena = ctx.arena();
        let is_aborted = |holder: TxnIndex| arena.slot(holder).is_aborted();
        let raw = txn.rw().read_keys().any(|key| {
            !ctx.with_reservation(key, |r| r.compare_put_unless_aborted(batch_id, idx, is_aborted))
        });
        let war = txn
            .rw()
            .write_keys()
            .any(|key| !ctx.with_reservation(key, |r| r.compare_get(batch_id, idx)));
        let waw = txn.rw().write_keys().any(|key| {
            !ctx.with_reservation(key, |r| r.compare_put_unless_aborted(batch_id, idx, is_aborted))
        });
        decide(self.enable_reordering, raw, war, waw)
    }
}
