// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Loom: pre-execute a whole block, break read-before-write cycles by rolling back the cheapest
//! transactions, commit the survivors in a topological order and deterministically re-execute
//! the rolled-back ones.
//!
//! With inter-block pipelining the next block pre-executes while the current one commits. Its
//! transactions may only read keys on which no earlier block has a put pending; one that does
//! releases its reservations and retries once the earlier block finalized.

mod reexecute;
mod rollback;
mod table;

pub use reexecute::{
    Footprint, NodeRecord, ReExecution, deterministic_re_execute, record, replay_nested,
};
pub use rollback::{RollbackPlan, min_w_rollback};
pub use table::{LoomEntry, LoomTable};

use crate::{
    arena::BlockArena,
    counters::{COMMIT_PHASE, EXECUTE_PHASE, REEXECUTE_PHASE, ROLLBACK_PHASE, observe_phase},
    errors::ExecutorResult,
    protocol::{Lifecycle, Protocol, spawn_named},
    statistics::Statistics,
    sync::RetryNotifier,
    thread_pool::{TaskHandle, ThreadPool},
    txn::{Block, Key, Transaction, TxnIndex, Value},
};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};
use tracing::{debug, error, info};

#[derive(Default)]
struct LoomTxnState {
    footprint: Mutex<Footprint>,
    started: Mutex<Option<Instant>>,
}

struct LoomBlock {
    block: Block,
    arena: BlockArena<LoomTxnState>,
}

impl LoomBlock {
    fn new(block: Block, batch_id: u64) -> Self {
        let arena = BlockArena::new(batch_id, block.len(), |_| LoomTxnState::default());
        Self { block, arena }
    }

    fn batch_id(&self) -> u64 {
        self.arena.batch_id()
    }
}

struct Shared {
    table: LoomTable,
    stop: AtomicBool,
    statistics: Arc<Statistics>,
    retry: RetryNotifier,
    inter_block: bool,
    nested_reexecution: bool,
}

/// Block-level pre-execution with minimum-weight rollback and deterministic re-execution.
pub struct Loom {
    shared: Arc<Shared>,
    blocks: Vec<Block>,
    num_threads: usize,
    lifecycle: Lifecycle,
}

impl Loom {
    pub const NAME: &'static str = "Loom";

    pub fn new(
        blocks: Vec<Block>,
        statistics: Arc<Statistics>,
        num_threads: usize,
        table_partitions: usize,
        inter_block: bool,
        nested_reexecution: bool,
    ) -> Self {
        info!(
            protocol = Self::NAME,
            num_threads, table_partitions, inter_block, nested_reexecution, "created"
        );
        Self {
            shared: Arc::new(Shared {
                table: LoomTable::new(table_partitions),
                stop: AtomicBool::new(false),
                statistics,
                retry: RetryNotifier::new(),
                inter_block,
                nested_reexecution,
            }),
            blocks,
            num_threads: num_threads.max(1),
            lifecycle: Lifecycle::Idle,
        }
    }
}

impl Shared {
    fn run(self: Arc<Self>, pool: ThreadPool, blocks: Vec<Block>) {
        let mut blocks = blocks
            .into_iter()
            .enumerate()
            .map(|(pos, block)| Arc::new(LoomBlock::new(block, pos as u64 + 1)))
            .peekable();
        let mut prefetched: Option<Vec<TaskHandle<()>>> = None;

        while let Some(current) = blocks.next() {
            if self.stop.load(Ordering::Acquire) {
                info!(protocol = Loom::NAME, block = current.block.id(), "stopping");
                break;
            }
            let started = Instant::now();
            let handles = match prefetched.take() {
                Some(handles) => handles,
                None => self.pre_execute(&pool, &current),
            };
            self.join_all(handles);
            observe_phase(Loom::NAME, EXECUTE_PHASE, started.elapsed());

            if self.inter_block {
                if let Some(next) = blocks.peek() {
                    prefetched = Some(self.pre_execute(&pool, next));
                }
            }

            self.settle_block(&current);
        }
        if let Some(handles) = prefetched {
            self.join_all(handles);
        }
        pool.shutdown();
    }

    fn join_all(&self, handles: Vec<TaskHandle<()>>) {
        for handle in handles {
            if let Err(err) = handle.join() {
                error!(protocol = Loom::NAME, error = %err, "pre-execution task failed");
            }
        }
    }

    /// Submits every transaction of `block` to the pool for pre-execution.
    fn pre_execute(self: &Arc<Self>, pool: &ThreadPool, block: &Arc<LoomBlock>) -> Vec<TaskHandle<()>> {
        debug!(protocol = Loom::NAME, block = block.block.id(), "pre-executing");
        (0..block.block.len())
            .filter_map(|idx| {
                let shared = self.clone();
                let block = block.clone();
                match pool.spawn(move || shared.pre_execute_txn(&block, idx)) {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        error!(protocol = Loom::NAME, error = %err, "failed to submit");
                        None
                    },
                }
            })
            .collect()
    }

    fn pre_execute_txn(&self, block: &LoomBlock, idx: TxnIndex) {
        let slot = block.arena.slot(idx);
        let txn = &block.block.txns()[idx];
        let batch_id = block.batch_id();
        *slot.state.started.lock() = Some(Instant::now());
        loop {
            let ticket = self.retry.reset_retry();
            slot.clear_aborted();
            let footprint = record(txn.as_ref(), |key: &str| {
                self.table.reserve_get(key, batch_id, idx).unwrap_or_else(|| {
                    slot.mark_aborted();
                    Value::new()
                })
            });
            self.statistics.journal_execute();
            self.statistics.journal_overheads(txn.cost());

            if !slot.is_aborted() {
                for key in footprint.rw.write_keys() {
                    self.table.reserve_put(key, batch_id);
                }
                *slot.state.footprint.lock() = footprint;
                return;
            }

            for key in footprint.rw.read_keys() {
                self.table.release_get(key, batch_id, idx);
            }
            debug!(protocol = Loom::NAME, batch_id, txn = idx, "waiting for an earlier block to finalize");
            self.statistics.journal_rollback(txn.cost());
            self.retry.wait_retry(ticket);
        }
    }

    /// Rollback, commit, re-execution and finalize of a pre-executed block.
    fn settle_block(&self, current: &LoomBlock) {
        let block_id = current.block.id();
        let txns: Vec<&dyn Transaction> = current.block.txns().iter().map(|txn| txn.as_ref()).collect();
        let guards: Vec<_> = (0..txns.len())
            .map(|idx| current.arena.slot(idx).state.footprint.lock())
            .collect();
        let footprints: Vec<&Footprint> = guards.iter().map(|guard| &**guard).collect();

        let rollback_started = Instant::now();
        let rws: Vec<_> = footprints.iter().map(|footprint| &footprint.rw).collect();
        let costs: Vec<u64> = txns.iter().map(|txn| txn.cost()).collect();
        let plan = min_w_rollback(&rws, &costs);
        for &idx in &plan.rolled_back {
            self.statistics.journal_rollback(costs[idx]);
        }
        let elapsed = rollback_started.elapsed();
        self.statistics
            .journal_rollback_execution(elapsed.as_micros() as u64);
        observe_phase(Loom::NAME, ROLLBACK_PHASE, elapsed);
        debug!(
            protocol = Loom::NAME,
            block = block_id,
            committed = plan.serial_order.len(),
            rolled_back = plan.rolled_back.len(),
            "rollback planned"
        );

        let commit_started = Instant::now();
        let mut last_writes: BTreeMap<&Key, &Value> = BTreeMap::new();
        for &idx in &plan.serial_order {
            last_writes.extend(footprints[idx].rw.writes.iter());
        }
        let committed_keys: BTreeSet<Key> = last_writes.keys().map(|key| (*key).clone()).collect();
        let writes: Vec<(&Key, &Value)> = last_writes.into_iter().collect();
        writes
            .par_iter()
            .for_each(|(key, value)| self.table.write(key, (*value).clone()));
        for &idx in &plan.serial_order {
            self.journal_commit(current, idx);
        }
        observe_phase(Loom::NAME, COMMIT_PHASE, commit_started.elapsed());

        if !plan.rolled_back.is_empty() {
            let started = Instant::now();
            let outcome = deterministic_re_execute(
                &txns,
                &footprints,
                &plan.rolled_back,
                &committed_keys,
                self.nested_reexecution,
                |key| self.table.read(key),
                |key, value| self.table.write(key, value),
            );
            for &idx in &plan.rolled_back {
                self.statistics.journal_execute();
                self.journal_commit(current, idx);
            }
            let elapsed = started.elapsed();
            self.statistics.journal_re_execution(elapsed.as_micros() as u64);
            observe_phase(Loom::NAME, REEXECUTE_PHASE, elapsed);
            debug!(
                protocol = Loom::NAME,
                block = block_id,
                waves = outcome.waves,
                rerun_nodes = outcome.rerun_nodes,
                replayed_nodes = outcome.replayed_nodes,
                "re-executed"
            );
        }

        self.finalize(current, &footprints);
        drop(guards);
        self.retry.notify_retry();
        self.statistics.journal_block();
    }

    fn journal_commit(&self, block: &LoomBlock, idx: TxnIndex) {
        let latency = block
            .arena
            .slot(idx)
            .state
            .started
            .lock()
            .map_or(0, |started| started.elapsed().as_micros() as u64);
        self.statistics.journal_commit(latency);
        block.arena.slot(idx).committed().signal();
    }

    /// Releases every reservation the block's transactions hold.
    fn finalize(&self, block: &LoomBlock, footprints: &[&Footprint]) {
        let batch_id = block.batch_id();
        footprints.par_iter().enumerate().for_each(|(idx, footprint)| {
            for key in footprint.rw.read_keys() {
                self.table.release_get(key, batch_id, idx);
            }
            for key in footprint.rw.write_keys() {
                self.table.release_put(key, batch_id);
            }
        });
    }
}

impl Protocol for Loom {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn start(&mut self) -> ExecutorResult<()> {
        self.lifecycle.ensure_idle(Self::NAME)?;
        let pool = ThreadPool::new("loom-pool", self.num_threads, true)?;
        let blocks = std::mem::take(&mut self.blocks);
        let shared = self.shared.clone();
        let handle = spawn_named("loom-driver".into(), None, move || shared.run(pool, blocks))?;
        self.lifecycle.running(vec![handle], Self::NAME);
        Ok(())
    }

    fn stop(&mut self) -> ExecutorResult<()> {
        self.lifecycle.ensure_started(Self::NAME)?;
        self.shared.stop.store(true, Ordering::Release);
        self.lifecycle.join(Self::NAME)
    }

    fn wait(&mut self) -> ExecutorResult<()> {
        self.lifecycle.join(Self::NAME)
    }

    fn snapshot(&self) -> BTreeMap<Key, Value> {
        self.shared.table.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        proptest_types::{
            TxnSpec, blind_write_blocks, blocks_strategy, computed_blocks, key, nested_blocks,
            nested_blocks_strategy, run_to_completion, serial_outcome,
        },
        txn::{RwSet, RwTransaction},
    };
    use proptest::prelude::*;
    use test_case::test_case;

    fn cycle_block() -> Vec<Block> {
        // tx0 reads x and writes y, tx1 reads y and writes x.
        vec![Block::new(0, vec![
            Arc::new(RwTransaction::new(vec!["x".into()], vec!["y".into()], "a").with_cost(3))
                as Arc<dyn Transaction>,
            Arc::new(RwTransaction::new(vec!["y".into()], vec!["x".into()], "b").with_cost(1)),
        ])]
    }

    #[test]
    fn read_write_cycle_rolls_back_the_cheaper_transaction() {
        let stats = Arc::new(Statistics::new("loom-cycle"));
        let mut loom = Loom::new(cycle_block(), stats.clone(), 2, 2, false, false);
        let snapshot = run_to_completion(&mut loom);
        assert_eq!(snapshot.get("y").map(String::as_str), Some("a"));
        assert_eq!(snapshot.get("x").map(String::as_str), Some("b"));
        assert_eq!(stats.commits(), 2);
        // Two pre-executions and one re-execution.
        assert_eq!(stats.executions(), 3);
    }

    /// Tagged writes applied block by block in the order the rollback plan serializes them:
    /// survivors topologically, then the rolled-back transactions by index.
    fn rollback_plan_outcome(specs: &[Vec<TxnSpec>]) -> BTreeMap<Key, Value> {
        let mut state = BTreeMap::new();
        for (block, txns) in specs.iter().enumerate() {
            let rws: Vec<RwSet> = txns
                .iter()
                .map(|spec| {
                    let mut rw = RwSet::default();
                    for &read in &spec.reads {
                        rw.reads.insert(key(read), Value::new());
                    }
                    for &write in &spec.writes {
                        rw.writes.insert(key(write), Value::new());
                    }
                    rw
                })
                .collect();
            let footprints: Vec<&RwSet> = rws.iter().collect();
            let plan = min_w_rollback(&footprints, &vec![0; footprints.len()]);
            for &idx in plan.serial_order.iter().chain(&plan.rolled_back) {
                for &write in &txns[idx].writes {
                    state.insert(key(write), format!("b{}-t{}", block, idx));
                }
            }
        }
        state
    }

    #[test]
    fn reader_is_serialized_before_the_writer_it_missed() {
        // tx1 reads and writes k0 after tx0 wrote it: tx1 must precede tx0, so tx0's write stays.
        let specs = vec![vec![TxnSpec::writes(&[0]), TxnSpec {
            reads: vec![0],
            writes: vec![0],
        }]];
        let blocks = blind_write_blocks(&specs);
        let mut loom = Loom::new(blocks, Arc::new(Statistics::new("loom-order")), 2, 2, false, false);
        let snapshot = run_to_completion(&mut loom);
        assert_eq!(snapshot.get("k0").map(String::as_str), Some("b0-t0"));
        assert_eq!(snapshot, rollback_plan_outcome(&specs));
    }

    #[test_case(false; "block at a time")]
    #[test_case(true; "pipelined")]
    fn blind_writes_keep_the_last_writer(inter_block: bool) {
        let specs = vec![
            vec![
                TxnSpec::writes(&[0, 1]),
                TxnSpec::writes(&[1]),
            ],
            vec![
                TxnSpec::writes(&[1, 2]),
                TxnSpec::writes(&[0]),
            ],
        ];
        let blocks = blind_write_blocks(&specs);
        let expected = serial_outcome(&blocks);
        let stats = Arc::new(Statistics::new("loom-lww"));
        let mut loom = Loom::new(blocks, stats.clone(), 3, 2, inter_block, false);
        assert_eq!(run_to_completion(&mut loom), expected);
        assert_eq!(stats.blocks(), 2);
        assert_eq!(stats.commits(), 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn outcome_is_independent_of_worker_count(
            specs in blocks_strategy(8, 3, 2, 10, 3),
            inter_block in any::<bool>(),
        ) {
            let outcome = |num_threads| {
                let mut loom = Loom::new(
                    computed_blocks(&specs),
                    Arc::new(Statistics::new("loom-det")),
                    num_threads,
                    3,
                    inter_block,
                    false,
                );
                run_to_completion(&mut loom)
            };
            prop_assert_eq!(outcome(1), outcome(4));
        }

        #[test]
        fn pipelining_does_not_change_the_outcome(specs in blocks_strategy(8, 3, 2, 10, 4)) {
            let outcome = |inter_block| {
                let mut loom = Loom::new(
                    computed_blocks(&specs),
                    Arc::new(Statistics::new("loom-pipe")),
                    3,
                    3,
                    inter_block,
                    false,
                );
                run_to_completion(&mut loom)
            };
            prop_assert_eq!(outcome(false), outcome(true));
        }

        #[test]
        fn nested_re_execution_matches_full_re_execution(specs in nested_blocks_strategy(6, 10, 3)) {
            let outcome = |nested| {
                let mut loom = Loom::new(
                    nested_blocks(&specs),
                    Arc::new(Statistics::new("loom-nested")),
                    3,
                    3,
                    false,
                    nested,
                );
                run_to_completion(&mut loom)
            };
            prop_assert_eq!(outcome(true), outcome(false));
        }

        #[test]
        fn tagged_writes_follow_the_rollback_plan(
            specs in blocks_strategy(8, 2, 2, 10, 3),
            inter_block in any::<bool>(),
        ) {
            let expected = rollback_plan_outcome(&specs);
            let mut loom = Loom::new(
                blind_write_blocks(&specs),
                Arc::new(Statistics::new("loom-plan")),
                3,
                3,
                inter_block,
                false,
            );
            prop_assert_eq!(run_to_completion(&mut loom), expected);
        }

        #[test]
        fn read_free_writes_match_serial_order(specs in blocks_strategy(8, 0, 3, 10, 3)) {
            let blocks = blind_write_blocks(&specs);
            let expected = serial_outcome(&blocks);
            let mut loom = Loom::new(blocks, Arc::new(Statistics::new("loom-blind")), 3, 3, true, true);
            prop_assert_eq!(run_to_completion(&mut loom), expected);
        }
    }
}
