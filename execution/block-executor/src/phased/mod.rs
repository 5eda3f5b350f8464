// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Barrier-synchronized batch execution shared by Aria, AriaER and Harmony.
//!
//! Every block is one batch. Its transactions are split across a fixed set of workers, and all
//! workers move through the same sequence of phases, separated by a `PhaseBarrier`:
//!
//! ```text
//!   rendezvous   execute + reserve            (policy hooks run under the partition lock)
//!   rendezvous   extra policy rounds          (0 for Aria and Harmony, 2 for AriaER)
//!   rendezvous   verify + commit              (conflicting transactions go to the lock table)
//!   rendezvous   fallback                     (ordered, pessimistic re-execution)
//!   rendezvous   cleanup                      (lock table lists are cleared)
//! ```
//!
//! The first rendezvous of a batch is also where a stop request is observed, see
//! `ExitCoordinator`.

mod aria;
mod harmony;

pub use aria::{AriaErPolicy, AriaPolicy, AriaReservation};
pub use harmony::{HarmonyOrder, HarmonyPolicy, HarmonyReservation};

use crate::{
    arena::BlockArena,
    counters::{FALLBACK_PHASE, VERIFY_PHASE, observe_phase},
    errors::ExecutorResult,
    protocol::{Lifecycle, Partitioning, Protocol, collect_values, spawn_named},
    statistics::Statistics,
    sync::{ExitCoordinator, ExitState, PhaseBarrier},
    txn::{Block, DirectView, Key, RwSet, StorageView, Transaction, TxnIndex, Value},
};
use dcc_partitioned_table::Table;
use std::{
    collections::{BTreeMap, BTreeSet},
    panic::{AssertUnwindSafe, catch_unwind, resume_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};
use tracing::{debug, error, info};

/// Decides which transactions of a batch may commit straight after optimistic execution.
///
/// Hooks receive the block arena so that they can publish per-transaction facts (abort flags,
/// ordering bounds) that other workers read in later phases.
pub trait ConflictPolicy: Send + Sync + Sized + 'static {
    /// Per-key reservation metadata, stored next to the committed value.
    type Reservation: Default + Send + 'static;
    /// Per-transaction state kept in the block arena.
    type TxnState: Send + Sync + 'static;

    const NAME: &'static str;
    const PARTITIONING: Partitioning;
    /// Whether `on_read`/`on_write` must run while transactions execute.
    const TRACKS_ACCESSES: bool = false;
    /// Number of barrier-separated rounds between execution and verification.
    const ROUNDS: usize = 0;

    fn init_state(&self, index: TxnIndex) -> Self::TxnState;

    /// Runs under the partition lock the first time `reader` reads a key.
    fn on_read(
        &self,
        _arena: &BlockArena<Self::TxnState>,
        _reader: TxnIndex,
        _reservation: &mut Self::Reservation,
    ) {
    }

    /// Runs under the partition lock the first time `writer` writes a key.
    fn on_write(
        &self,
        _arena: &BlockArena<Self::TxnState>,
        _writer: TxnIndex,
        _reservation: &mut Self::Reservation,
    ) {
    }

    /// Reservations taken right after `txn` executed, within the execute phase.
    fn reserve(&self, _ctx: &BatchContext<'_, Self>, _txn: &PhasedTransaction) {}

    /// Runs round `round` for `txn`. Returns true if `txn` must fall back; the executor then
    /// marks it aborted in the arena for all later rounds.
    fn run_round(&self, _round: usize, _ctx: &BatchContext<'_, Self>, _txn: &PhasedTransaction) -> bool {
        false
    }

    /// Final verification of a transaction that survived all rounds.
    fn has_conflict(&self, ctx: &BatchContext<'_, Self>, txn: &PhasedTransaction) -> bool;
}

/// Table entry of the phased protocols.
#[derive(Default)]
pub struct PhasedEntry<R> {
    value: Value,
    reservation: R,
    // (batch, txn) that installed `value` during verify + commit.
    last_commit: Option<(u64, TxnIndex)>,
}

#[derive(Default)]
struct LockEntry {
    batch_id: u64,
    deps_get: Vec<TxnIndex>,
    deps_put: Vec<TxnIndex>,
}

impl LockEntry {
    fn reset_if_stale(&mut self, batch_id: u64) {
        if self.batch_id != batch_id {
            self.batch_id = batch_id;
            self.deps_get.clear();
            self.deps_put.clear();
        }
    }
}

/// What a phase needs to look at besides the transaction itself.
pub struct BatchContext<'a, P: ConflictPolicy> {
    table: &'a Table<Key, PhasedEntry<P::Reservation>>,
    arena: &'a BlockArena<P::TxnState>,
}

impl<P: ConflictPolicy> BatchContext<'_, P> {
    pub fn batch_id(&self) -> u64 {
        self.arena.batch_id()
    }

    pub fn arena(&self) -> &BlockArena<P::TxnState> {
        self.arena
    }

    /// Runs `f` on the reservation of `key` under its partition lock.
    pub fn with_reservation<R>(&self, key: &str, f: impl FnOnce(&mut P::Reservation) -> R) -> R {
        self.table.put(key, |entry| f(&mut entry.reservation))
    }
}

/// A transaction as seen by one worker during one batch.
pub struct PhasedTransaction {
    index: TxnIndex,
    txn: Arc<dyn Transaction>,
    rw: RwSet,
    flag_conflict: bool,
    locked_keys: Vec<Key>,
    started: Option<Instant>,
}

impl PhasedTransaction {
    fn new(index: TxnIndex, txn: Arc<dyn Transaction>) -> Self {
        Self {
            index,
            txn,
            rw: RwSet::default(),
            flag_conflict: false,
            locked_keys: vec![],
            started: None,
        }
    }

    pub fn index(&self) -> TxnIndex {
        self.index
    }

    pub fn rw(&self) -> &RwSet {
        &self.rw
    }

    pub fn is_conflicting(&self) -> bool {
        self.flag_conflict
    }

    fn latency_us(&self) -> u64 {
        self.started
            .map(|started| started.elapsed().as_micros() as u64)
            .unwrap_or_default()
    }
}

struct BatchState<S> {
    arena: BlockArena<S>,
    has_conflict: AtomicBool,
}

/// One worker's share of one batch.
struct WorkerBatch<S> {
    state: Arc<BatchState<S>>,
    txns: Vec<PhasedTransaction>,
}

struct Shared<P: ConflictPolicy> {
    policy: P,
    table: Table<Key, PhasedEntry<P::Reservation>>,
    lock_table: Table<Key, LockEntry>,
    barrier: PhaseBarrier,
    exit: ExitCoordinator,
    statistics: Arc<Statistics>,
}

/// Optimistic, barrier-synchronized protocol parameterized by its conflict policy.
pub struct PhasedProtocol<P: ConflictPolicy> {
    shared: Arc<Shared<P>>,
    blocks: Vec<Block>,
    num_workers: usize,
    pin_workers: bool,
    lifecycle: Lifecycle,
}

pub type Aria = PhasedProtocol<AriaPolicy>;
pub type AriaEr = PhasedProtocol<AriaErPolicy>;
pub type Harmony = PhasedProtocol<HarmonyPolicy>;

impl Aria {
    pub fn new(
        blocks: Vec<Block>,
        statistics: Arc<Statistics>,
        num_threads: usize,
        table_partitions: usize,
        enable_reordering: bool,
    ) -> Self {
        Self::with_policy(
            AriaPolicy::new(enable_reordering),
            blocks,
            statistics,
            num_threads,
            table_partitions,
        )
    }
}

impl AriaEr {
    pub fn new(
        blocks: Vec<Block>,
        statistics: Arc<Statistics>,
        num_threads: usize,
        table_partitions: usize,
        enable_reordering: bool,
    ) -> Self {
        Self::with_policy(
            AriaErPolicy::new(enable_reordering),
            blocks,
            statistics,
            num_threads,
            table_partitions,
        )
    }
}

impl Harmony {
    pub fn new(
        blocks: Vec<Block>,
        statistics: Arc<Statistics>,
        num_threads: usize,
        table_partitions: usize,
        enable_inter_block: bool,
    ) -> Self {
        Self::with_policy(
            HarmonyPolicy::new(enable_inter_block),
            blocks,
            statistics,
            num_threads,
            table_partitions,
        )
    }
}

impl<P: ConflictPolicy> PhasedProtocol<P> {
    pub fn with_policy(
        policy: P,
        blocks: Vec<Block>,
        statistics: Arc<Statistics>,
        num_threads: usize,
        table_partitions: usize,
    ) -> Self {
        let num_workers = num_threads.max(1);
        Self {
            shared: Arc::new(Shared {
                policy,
                table: Table::new(table_partitions),
                lock_table: Table::new(table_partitions),
                barrier: PhaseBarrier::new(num_workers),
                exit: ExitCoordinator::new(num_workers),
                statistics,
            }),
            blocks,
            num_workers,
            pin_workers: true,
            lifecycle: Lifecycle::Idle,
        }
    }

    /// Disables core pinning of the workers (enabled by default).
    pub fn without_pinning(mut self) -> Self {
        self.pin_workers = false;
        self
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Number of completed rendezvous across all batches so far.
    pub fn barrier_generations(&self) -> u64 {
        self.shared.barrier.generation()
    }

    fn split_blocks(&self, blocks: Vec<Block>) -> Vec<Vec<WorkerBatch<P::TxnState>>> {
        let mut per_worker: Vec<Vec<WorkerBatch<P::TxnState>>> =
            (0..self.num_workers).map(|_| vec![]).collect();
        for (pos, block) in blocks.into_iter().enumerate() {
            let batch_id = pos as u64 + 1;
            let state = Arc::new(BatchState {
                arena: BlockArena::new(batch_id, block.len(), |idx| {
                    self.shared.policy.init_state(idx)
                }),
                has_conflict: AtomicBool::new(false),
            });
            let assignment = P::PARTITIONING.assign(block.len(), self.num_workers);
            for (worker, indices) in assignment.into_iter().enumerate() {
                per_worker[worker].push(WorkerBatch {
                    state: state.clone(),
                    txns: indices
                        .into_iter()
                        .map(|idx| PhasedTransaction::new(idx, block.txns()[idx].clone()))
                        .collect(),
                });
            }
        }
        per_worker
    }
}

impl<P: ConflictPolicy> Protocol for PhasedProtocol<P> {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn start(&mut self) -> ExecutorResult<()> {
        self.lifecycle.ensure_idle(P::NAME)?;
        let blocks = std::mem::take(&mut self.blocks);
        let num_blocks = blocks.len();
        let per_worker = self.split_blocks(blocks);

        let mut handles = Vec::with_capacity(self.num_workers);
        for (worker_id, batches) in per_worker.into_iter().enumerate() {
            let shared = self.shared.clone();
            let pin_index = self.pin_workers.then_some(worker_id);
            handles.push(spawn_named(
                format!("{}-worker-{}", P::NAME.to_lowercase(), worker_id),
                pin_index,
                move || shared.run_worker(worker_id, batches),
            )?);
        }
        info!(protocol = P::NAME, num_blocks, "dispatched blocks");
        self.lifecycle.running(handles, P::NAME);
        Ok(())
    }

    fn stop(&mut self) -> ExecutorResult<()> {
        self.lifecycle.ensure_started(P::NAME)?;
        self.shared.exit.request();
        self.lifecycle.join(P::NAME)
    }

    fn wait(&mut self) -> ExecutorResult<()> {
        self.lifecycle.join(P::NAME)
    }

    fn snapshot(&self) -> BTreeMap<Key, Value> {
        collect_values(&self.shared.table, |entry| &entry.value)
    }
}

impl<P: ConflictPolicy> Shared<P> {
    fn run_worker(&self, worker_id: usize, batches: Vec<WorkerBatch<P::TxnState>>) {
        let mut confirmed = false;
        let mut batches = batches.into_iter();
        while let Some(mut batch) = batches.next() {
            let exit_now = self.exit.state() == ExitState::AllConfirmed;
            self.barrier.arrive_and_wait();
            if exit_now {
                debug!(protocol = P::NAME, worker_id, "worker exiting");
                return;
            }
            if !confirmed && self.exit.is_requested() {
                self.exit.confirm();
                confirmed = true;
            }
            let result = catch_unwind(AssertUnwindSafe(|| self.process_batch(worker_id, &mut batch)));
            if let Err(payload) = result {
                error!(protocol = P::NAME, worker_id, "worker panicked, leaving the remaining batches");
                // Peers may wait on any of this worker's transactions in a fallback phase.
                for batch in std::iter::once(batch).chain(batches) {
                    for txn in &batch.txns {
                        batch.state.arena.slot(txn.index).committed().signal();
                    }
                }
                if !confirmed {
                    self.exit.confirm();
                }
                self.barrier.leave();
                resume_unwind(payload);
            }
        }
    }

    fn process_batch(&self, worker_id: usize, batch: &mut WorkerBatch<P::TxnState>) {
        let state = batch.state.clone();
        let ctx = BatchContext {
            table: &self.table,
            arena: &state.arena,
        };

        for txn in batch.txns.iter_mut() {
            self.execute(&ctx, txn);
            self.policy.reserve(&ctx, txn);
        }

        for round in 0..P::ROUNDS {
            self.barrier.arrive_and_wait();
            let flagged: Vec<usize> = batch
                .txns
                .iter()
                .enumerate()
                .filter(|(_, txn)| !txn.flag_conflict && self.policy.run_round(round, &ctx, txn))
                .map(|(pos, _)| pos)
                .collect();
            // Abort flags become visible to other workers only from the next round on.
            for pos in flagged {
                self.flag_conflict(&ctx, &state, &mut batch.txns[pos]);
                ctx.arena.slot(batch.txns[pos].index).mark_aborted();
            }
        }

        self.barrier.arrive_and_wait();
        let verify_started = Instant::now();
        for txn in batch.txns.iter_mut() {
            if txn.flag_conflict {
                continue;
            }
            if self.policy.has_conflict(&ctx, txn) {
                self.flag_conflict(&ctx, &state, txn);
            } else {
                self.commit(&ctx, txn);
            }
        }
        if worker_id == 0 {
            observe_phase(P::NAME, VERIFY_PHASE, verify_started.elapsed());
        }

        self.barrier.arrive_and_wait();
        let has_conflict = state.has_conflict.load(Ordering::Acquire);
        if has_conflict {
            let fallback_started = Instant::now();
            for txn in batch.txns.iter_mut().filter(|txn| txn.flag_conflict) {
                self.fallback(&ctx, txn);
            }
            let elapsed = fallback_started.elapsed();
            self.statistics
                .journal_re_execution(elapsed.as_micros() as u64);
            if worker_id == 0 {
                observe_phase(P::NAME, FALLBACK_PHASE, elapsed);
            }
        }

        self.barrier.arrive_and_wait();
        if has_conflict {
            for txn in batch.txns.iter_mut() {
                self.cleanup(ctx.batch_id(), txn);
            }
        }
        if worker_id == 0 {
            self.statistics.journal_block();
        }
    }

    fn execute(&self, ctx: &BatchContext<'_, P>, txn: &mut PhasedTransaction) {
        txn.rw.clear();
        txn.flag_conflict = false;
        txn.started.get_or_insert_with(Instant::now);
        let mut view = ExecutionView {
            shared: self,
            arena: ctx.arena,
            index: txn.index,
            rw: &mut txn.rw,
        };
        txn.txn.execute(&mut view);
        self.statistics.journal_execute();
        self.statistics.journal_overheads(txn.txn.cost());
    }

    fn flag_conflict(
        &self,
        ctx: &BatchContext<'_, P>,
        state: &BatchState<P::TxnState>,
        txn: &mut PhasedTransaction,
    ) {
        txn.flag_conflict = true;
        state.has_conflict.store(true, Ordering::Release);
        let batch_id = ctx.batch_id();
        for key in txn.rw.read_keys() {
            self.lock_table.put(key, |entry| {
                entry.reset_if_stale(batch_id);
                entry.deps_get.push(txn.index);
            });
        }
        for key in txn.rw.write_keys() {
            self.lock_table.put(key, |entry| {
                entry.reset_if_stale(batch_id);
                entry.deps_put.push(txn.index);
            });
        }
        txn.locked_keys = txn
            .rw
            .read_keys()
            .chain(txn.rw.write_keys())
            .cloned()
            .collect();
    }

    /// Installs the buffered writes. Within a batch, a key keeps the write of the highest
    /// committing transaction.
    fn commit(&self, ctx: &BatchContext<'_, P>, txn: &PhasedTransaction) {
        let batch_id = ctx.batch_id();
        for (key, value) in &txn.rw.writes {
            self.table.put(key, |entry| {
                if entry
                    .last_commit
                    .is_none_or(|(batch, idx)| batch != batch_id || idx < txn.index)
                {
                    entry.value = value.clone();
                    entry.last_commit = Some((batch_id, txn.index));
                }
            });
        }
        self.statistics.journal_commit(txn.latency_us());
    }

    /// Pessimistic re-execution against the live table, after every lock-table transaction with a
    /// smaller index that touches an overlapping key has finished its own fallback. Writes follow
    /// the same highest-index-wins rule as `commit`.
    fn fallback(&self, ctx: &BatchContext<'_, P>, txn: &mut PhasedTransaction) {
        let batch_id = ctx.batch_id();
        let mut deps: BTreeSet<TxnIndex> = BTreeSet::new();
        for key in txn.rw.read_keys() {
            self.lock_table.get(key, |entry| {
                if entry.batch_id == batch_id {
                    deps.extend(entry.deps_put.iter().filter(|&&dep| dep < txn.index));
                }
            });
        }
        for key in txn.rw.write_keys() {
            self.lock_table.get(key, |entry| {
                if entry.batch_id == batch_id {
                    deps.extend(
                        entry
                            .deps_get
                            .iter()
                            .chain(entry.deps_put.iter())
                            .filter(|&&dep| dep < txn.index),
                    );
                }
            });
        }
        for dep in deps {
            ctx.arena.slot(dep).committed().wait();
        }

        self.statistics.journal_rollback(txn.txn.cost());
        txn.rw.clear();
        let (table, index) = (&self.table, txn.index);
        let mut view = DirectView::new(
            &mut txn.rw,
            |key: &str| table.get(key, |entry| entry.value.clone()),
            |key: &str, value: &Value| {
                table.put(key, |entry| {
                    // Skipped once a higher transaction of this batch installed its write.
                    if entry
                        .last_commit
                        .is_none_or(|(batch, idx)| batch != batch_id || idx <= index)
                    {
                        entry.value = value.clone();
                        entry.last_commit = Some((batch_id, index));
                    }
                })
            },
        );
        txn.txn.execute(&mut view);
        ctx.arena.slot(txn.index).committed().signal();

        self.statistics.journal_execute();
        self.statistics.journal_overheads(txn.txn.cost());
        self.statistics.journal_commit(txn.latency_us());
    }

    fn cleanup(&self, batch_id: u64, txn: &mut PhasedTransaction) {
        for key in txn.locked_keys.drain(..) {
            self.lock_table.put(&key, |entry| {
                if entry.batch_id == batch_id {
                    entry.deps_get.clear();
                    entry.deps_put.clear();
                }
            });
        }
    }
}

/// Buffers writes locally and runs the policy's access hooks against the table.
struct ExecutionView<'a, P: ConflictPolicy> {
    shared: &'a Shared<P>,
    arena: &'a BlockArena<P::TxnState>,
    index: TxnIndex,
    rw: &'a mut RwSet,
}

impl<P: ConflictPolicy> StorageView for ExecutionView<'_, P> {
    fn get(&mut self, key: &str) -> Value {
        if let Some(value) = self.rw.writes.get(key) {
            return value.clone();
        }
        if let Some(value) = self.rw.reads.get(key) {
            return value.clone();
        }
        let value = self.shared.table.put(key, |entry| {
            if P::TRACKS_ACCESSES {
                self.shared
                    .policy
                    .on_read(self.arena, self.index, &mut entry.reservation);
            }
            entry.value.clone()
        });
        self.rw.reads.insert(key.to_owned(), value.clone());
        value
    }

    fn put(&mut self, key: &str, value: Value) {
        let first_write = self.rw.writes.insert(key.to_owned(), value).is_none();
        if first_write && P::TRACKS_ACCESSES {
            self.shared.table.put(key, |entry| {
                self.shared
                    .policy
                    .on_write(self.arena, self.index, &mut entry.reservation)
            });
        }
    }
}

#[cfg(test)]
mod tests;
