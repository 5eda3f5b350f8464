// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    errors::ExecutorResult,
    protocol::{Lifecycle, Protocol, collect_values, spawn_named},
    statistics::Statistics,
    thread_pool::ThreadPool,
    txn::{Block, Key, StorageView, TxnIndex, Value},
};
use dcc_partitioned_table::Table;
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};
use tracing::{error, info};

/// Committed value plus the accesses of the block currently executing.
#[derive(Default)]
struct FractalEntry {
    value: Value,
    batch_id: u64,
    writer: Option<TxnIndex>,
    readers: Vec<TxnIndex>,
}

impl FractalEntry {
    fn reset_if_stale(&mut self, batch_id: u64) {
        if self.batch_id != batch_id {
            self.batch_id = batch_id;
            self.writer = None;
            self.readers.clear();
        }
    }
}

struct Shared {
    table: Table<Key, FractalEntry>,
    stop: AtomicBool,
    statistics: Arc<Statistics>,
}

/// Submits every transaction of a block to the pool, executes it directly on the table while
/// recording per-key readers and writer, and waits for the whole block before moving on.
///
/// Transactions of the same block are not reconciled against each other, so the outcome is only
/// well defined when they touch disjoint keys.
pub struct Fractal {
    shared: Arc<Shared>,
    blocks: Vec<Block>,
    num_threads: usize,
    lifecycle: Lifecycle,
}

impl Fractal {
    pub const NAME: &'static str = "Fractal";

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
            }),
            blocks,
            num_threads: num_threads.max(1),
            lifecycle: Lifecycle::Idle,
        }
    }

    /// Readers and writer recorded for `key` while `batch_id` executed, if that block was the
    /// last one to touch it.
    pub fn accesses(&self, key: &str, batch_id: u64) -> Option<(Option<TxnIndex>, Vec<TxnIndex>)> {
        self.shared
            .table
            .try_get(key, |entry| {
                (entry.batch_id == batch_id).then(|| {
                    let mut readers = entry.readers.clone();
                    readers.sort_unstable();
                    (entry.writer, readers)
                })
            })
            .flatten()
    }
}

struct FractalView<'a> {
    table: &'a Table<Key, FractalEntry>,
    batch_id: u64,
    index: TxnIndex,
}

impl StorageView for FractalView<'_> {
    fn get(&mut self, key: &str) -> Value {
        self.table.put(key, |entry| {
            entry.reset_if_stale(self.batch_id);
            if !entry.readers.contains(&self.index) {
                entry.readers.push(self.index);
            }
            entry.value.clone()
        })
    }

    fn put(&mut self, key: &str, value: Value) {
        self.table.put(key, |entry| {
            entry.reset_if_stale(self.batch_id);
            entry.writer = Some(self.index);
            entry.value = value;
        });
    }
}

impl Shared {
    fn run(self: Arc<Self>, pool: ThreadPool, blocks: Vec<Block>) {
        for (pos, block) in blocks.into_iter().enumerate() {
            if self.stop.load(Ordering::Acquire) {
                info!(protocol = Fractal::NAME, block = block.id(), "stopping");
                break;
            }
            let batch_id = pos as u64 + 1;
            let mut handles = Vec::with_capacity(block.len());
            for (index, txn) in block.txns().iter().enumerate() {
                let shared = self.clone();
                let txn = txn.clone();
                let spawned = pool.spawn(move || {
                    let started = Instant::now();
                    txn.execute(&mut FractalView {
                        table: &shared.table,
                        batch_id,
                        index,
                    });
                    shared.statistics.journal_execute();
                    shared.statistics.journal_overheads(txn.cost());
                    shared
                        .statistics
                        .journal_commit(started.elapsed().as_micros() as u64);
                });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => error!(protocol = Fractal::NAME, error = %err, "failed to submit"),
                }
            }
            for handle in handles {
                if let Err(err) = handle.join() {
                    error!(protocol = Fractal::NAME, error = %err, "transaction task failed");
                }
            }
            self.statistics.journal_block();
        }
        pool.shutdown();
    }
}

impl Protocol for Fractal {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn start(&mut self) -> ExecutorResult<()> {
        self.lifecycle.ensure_idle(Self::NAME)?;
        let pool = ThreadPool::new("fractal-pool", self.num_threads, true)?;
        let blocks = std::mem::take(&mut self.blocks);
        let shared = self.shared.clone();
        let handle = spawn_named("fractal-driver".into(), None, move || shared.run(pool, blocks))?;
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
        proptest_types::{disjoint_blocks, run_to_completion, serial_outcome},
        txn::{RwTransaction, Transaction},
    };
    use claims::{assert_none, assert_some_eq};
    use test_case::test_case;

    #[test_case(1; "single thread")]
    #[test_case(4; "four threads")]
    fn disjoint_blocks_match_serial_order(num_threads: usize) {
        let blocks = disjoint_blocks(5, 16);
        let expected = serial_outcome(&blocks);
        let stats = Arc::new(Statistics::new("fractal-disjoint"));
        let mut fractal = Fractal::new(blocks, stats.clone(), num_threads, 4);
        assert_eq!(run_to_completion(&mut fractal), expected);
        assert_eq!(stats.commits(), 5 * 16);
        assert_eq!(stats.blocks(), 5);
    }

    #[test]
    fn accesses_are_tracked_per_block() {
        let blocks = vec![
            Block::new(0, vec![
                Arc::new(RwTransaction::new(vec!["a".into()], vec!["b".into()], "1")) as Arc<dyn Transaction>,
                Arc::new(RwTransaction::new(vec!["a".into()], vec![], "")),
            ]),
            Block::new(1, vec![Arc::new(RwTransaction::new(vec![], vec!["c".into()], "2"))]),
        ];
        let mut fractal = Fractal::new(blocks, Arc::new(Statistics::new("fractal-access")), 2, 2);
        run_to_completion(&mut fractal);

        assert_some_eq!(fractal.accesses("a", 1), (None, vec![0, 1]));
        assert_some_eq!(fractal.accesses("b", 1), (Some(0), vec![]));
        assert_some_eq!(fractal.accesses("c", 2), (Some(0), vec![]));
        assert_none!(fractal.accesses("a", 2));
    }
}
