// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! OptME: simulate a block against the committed state, order the simulated transactions with an
//! address-based conflict graph, commit the ones that received a consistent sequence number and
//! re-execute the rest in conflict-free epochs.

mod acg;

pub use acg::{Address, ConflictGraph, Unit};

use crate::{
    arena::BlockArena,
    counters::{COMMIT_PHASE, EXECUTE_PHASE, REEXECUTE_PHASE, VERIFY_PHASE, observe_phase},
    errors::ExecutorResult,
    protocol::{Lifecycle, Protocol, collect_values, spawn_named},
    schedule::{conflict_free_waves, execute_in_waves},
    statistics::Statistics,
    thread_pool::ThreadPool,
    txn::{Block, BufferedView, Key, RwSet, Transaction, TxnIndex, Value},
};
use dcc_partitioned_table::Table;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};
use tracing::{debug, error, info};

/// Committed value plus the reservations of the block being processed.
#[derive(Default)]
struct OptMeEntry {
    value: Value,
    block_id_get: u64,
    block_id_put: u64,
    reserved_put_num: usize,
}

#[derive(Default)]
struct OptMeTxnState {
    rw: Mutex<RwSet>,
    started: Mutex<Option<Instant>>,
}

struct Shared {
    table: Table<Key, OptMeEntry>,
    stop: AtomicBool,
    statistics: Arc<Statistics>,
    num_threads: usize,
}

/// Simulate-then-reorder protocol.
pub struct OptMe {
    shared: Arc<Shared>,
    blocks: Vec<Block>,
    lifecycle: Lifecycle,
}

impl OptMe {
    pub const NAME: &'static str = "OptME";

    pub fn new(
        blocks: Vec<Block>,
        statistics: Arc<Statistics>,
        num_threads: usize,
        table_partitions: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Table::new(table_partitions),
                stop: AtomicBool::new(false),
                statistics,
                num_threads: num_threads.max(1),
            }),
            blocks,
            lifecycle: Lifecycle::Idle,
        }
    }
}

type OptMeArena = BlockArena<OptMeTxnState>;

impl Shared {
    fn run(self: Arc<Self>, pool: ThreadPool, blocks: Vec<Block>) {
        for (pos, block) in blocks.into_iter().enumerate() {
            if self.stop.load(Ordering::Acquire) {
                info!(protocol = OptMe::NAME, block = block.id(), "stopping");
                break;
            }
            let block = Arc::new(block);
            let arena = Arc::new(OptMeArena::new(pos as u64 + 1, block.len(), |_| {
                OptMeTxnState::default()
            }));
            self.simulate(&pool, &block, &arena);
            self.settle_block(&block, &arena);
            self.statistics.journal_block();
        }
        pool.shutdown();
    }

    /// Executes every transaction on the pool against the committed state and records its
    /// read-write set and reservations.
    fn simulate(self: &Arc<Self>, pool: &ThreadPool, block: &Arc<Block>, arena: &Arc<OptMeArena>) {
        let started = Instant::now();
        let handles: Vec<_> = (0..block.len())
            .filter_map(|idx| {
                let shared = self.clone();
                let block = block.clone();
                let arena = arena.clone();
                let spawned = pool.spawn(move || {
                    let txn = &block.txns()[idx];
                    let batch_id = arena.batch_id();
                    let state = &arena.slot(idx).state;
                    *state.started.lock() = Some(Instant::now());
                    let mut rw = RwSet::default();
                    txn.execute(&mut BufferedView::new(&mut rw, |key: &str| {
                        shared.reserve_get(key, batch_id)
                    }));
                    for key in rw.write_keys() {
                        shared.reserve_put(key, batch_id);
                    }
                    *state.rw.lock() = rw;
                    shared.statistics.journal_execute();
                    shared.statistics.journal_overheads(txn.cost());
                });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        error!(protocol = OptMe::NAME, error = %err, "failed to submit");
                        None
                    },
                }
            })
            .collect();
        for handle in handles {
            if let Err(err) = handle.join() {
                error!(protocol = OptMe::NAME, error = %err, "simulation task failed");
            }
        }
        observe_phase(OptMe::NAME, EXECUTE_PHASE, started.elapsed());
    }

    fn reserve_get(&self, key: &str, batch_id: u64) -> Value {
        self.table.put(key, |entry| {
            entry.block_id_get = entry.block_id_get.max(batch_id);
            entry.value.clone()
        })
    }

    fn reserve_put(&self, key: &str, batch_id: u64) {
        self.table.put(key, |entry| {
            if entry.block_id_put == batch_id {
                entry.reserved_put_num += 1;
            } else {
                entry.block_id_put = batch_id;
                entry.reserved_put_num = 1;
            }
        });
    }

    fn release(&self, rw: &RwSet, batch_id: u64) {
        for key in rw.read_keys() {
            self.table.put(key, |entry| {
                if entry.block_id_get == batch_id {
                    entry.block_id_get = 0;
                }
            });
        }
        for key in rw.write_keys() {
            self.table.put(key, |entry| {
                if entry.block_id_put == batch_id {
                    entry.reserved_put_num = entry.reserved_put_num.saturating_sub(1);
                    if entry.reserved_put_num == 0 {
                        entry.block_id_put = 0;
                    }
                }
            });
        }
    }

    fn journal_commit(&self, arena: &OptMeArena, idx: TxnIndex) {
        let latency = arena
            .slot(idx)
            .state
            .started
            .lock()
            .map_or(0, |started| started.elapsed().as_micros() as u64);
        self.statistics.journal_commit(latency);
    }

    fn settle_block(&self, block: &Block, arena: &OptMeArena) {
        let guards: Vec<_> = (0..block.len())
            .map(|idx| arena.slot(idx).state.rw.lock())
            .collect();
        let footprints: Vec<&RwSet> = guards.iter().map(|guard| &**guard).collect();

        // Intra-epoch reordering.
        let reorder_started = Instant::now();
        let mut graph = ConflictGraph::parallel_construct(&footprints, self.num_threads);
        graph.hierarchical_sort();
        graph.validate();
        let tx_list = graph.tx_list();
        let aborted = graph.aborted_txs();
        let elapsed = reorder_started.elapsed();
        self.statistics
            .journal_rollback_execution(elapsed.as_micros() as u64);
        observe_phase(OptMe::NAME, VERIFY_PHASE, elapsed);
        debug!(
            protocol = OptMe::NAME,
            block = block.id(),
            committed = tx_list.len(),
            aborted = aborted.len(),
            "reordered"
        );

        // The highest (sequence, index) writer of every key wins.
        let commit_started = Instant::now();
        let mut last_writes: BTreeMap<&Key, &Value> = BTreeMap::new();
        for &idx in &tx_list {
            last_writes.extend(footprints[idx].writes.iter());
        }
        let writes: Vec<(&Key, &Value)> = last_writes.into_iter().collect();
        writes.par_iter().for_each(|(key, value)| {
            self.table.put(key.as_str(), |entry| entry.value = (*value).clone());
        });
        for &idx in &tx_list {
            self.journal_commit(arena, idx);
        }
        observe_phase(OptMe::NAME, COMMIT_PHASE, commit_started.elapsed());

        // Inter-epoch reordering and parallel re-execution.
        if !aborted.is_empty() {
            let started = Instant::now();
            let txns: Vec<&dyn Transaction> = block.txns().iter().map(|txn| txn.as_ref()).collect();
            let epochs = conflict_free_waves(
                &aborted.iter().map(|&idx| footprints[idx]).collect::<Vec<_>>(),
            );
            execute_in_waves(
                &epochs,
                |key| self.table.get(key, |entry| entry.value.clone()),
                |pos, view| txns[aborted[pos]].execute(view),
                |_, rw| {
                    for (key, value) in rw.writes {
                        self.table.put(&key, |entry| entry.value = value);
                    }
                },
            );
            for &idx in &aborted {
                self.statistics.journal_execute();
                self.statistics.journal_rollback(txns[idx].cost());
                self.journal_commit(arena, idx);
            }
            let elapsed = started.elapsed();
            self.statistics.journal_re_execution(elapsed.as_micros() as u64);
            observe_phase(OptMe::NAME, REEXECUTE_PHASE, elapsed);
            debug!(protocol = OptMe::NAME, block = block.id(), epochs = epochs.len(), "re-executed");
        }

        let batch_id = arena.batch_id();
        footprints
            .par_iter()
            .for_each(|rw| self.release(rw, batch_id));
    }
}

impl Protocol for OptMe {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn start(&mut self) -> ExecutorResult<()> {
        self.lifecycle.ensure_idle(Self::NAME)?;
        let pool = ThreadPool::new("optme-pool", self.shared.num_threads, true)?;
        let blocks = std::mem::take(&mut self.blocks);
        let shared = self.shared.clone();
        let handle = spawn_named("optme-driver".into(), None, move || shared.run(pool, blocks))?;
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
        collect_values(&self.shared.table, |entry| &entry.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        proptest_types::{
            blocks_strategy, computed_blocks, disjoint_blocks, run_to_completion, serial_outcome,
        },
        txn::{FnTransaction, RwTransaction},
    };
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(1; "one thread")]
    #[test_case(4; "four threads")]
    fn disjoint_blocks_match_serial_order(num_threads: usize) {
        let blocks = disjoint_blocks(4, 12);
        let expected = serial_outcome(&blocks);
        let stats = Arc::new(Statistics::new("optme-disjoint"));
        let mut optme = OptMe::new(blocks, stats.clone(), num_threads, 4);
        assert_eq!(run_to_completion(&mut optme), expected);
        assert_eq!(stats.commits(), 4 * 12);
        assert_eq!(stats.executions(), 4 * 12);
    }

    #[test]
    fn second_updater_is_re_executed_after_the_first() {
        let increment = || {
            Arc::new(FnTransaction::new(|view| {
                let next = view.get("counter").parse::<u64>().unwrap_or(0) + 1;
                view.put("counter", next.to_string());
            })) as Arc<dyn Transaction>
        };
        let blocks = vec![Block::new(0, vec![
            increment(),
            increment(),
            Arc::new(RwTransaction::new(vec![], vec!["other".into()], "x")),
        ])];
        let stats = Arc::new(Statistics::new("optme-updaters"));
        let mut optme = OptMe::new(blocks, stats.clone(), 2, 2);
        let snapshot = run_to_completion(&mut optme);

        assert_eq!(snapshot.get("counter").map(String::as_str), Some("2"));
        assert_eq!(snapshot.get("other").map(String::as_str), Some("x"));
        assert_eq!(stats.commits(), 3);
        // The second increment ran again.
        assert_eq!(stats.executions(), 4);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn outcome_is_independent_of_worker_count(specs in blocks_strategy(8, 3, 2, 12, 3)) {
            let outcome = |num_threads| {
                let mut optme = OptMe::new(
                    computed_blocks(&specs),
                    Arc::new(Statistics::new("optme-det")),
                    num_threads,
                    3,
                );
                run_to_completion(&mut optme)
            };
            prop_assert_eq!(outcome(1), outcome(4));
        }
    }
}
