// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    errors::ExecutorResult,
    protocol::{Lifecycle, Protocol, collect_values, spawn_named},
    statistics::Statistics,
    txn::{Block, BufferedView, Key, RwSet, Value},
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
use tracing::info;

struct Shared {
    table: Table<Key, Value>,
    stop: AtomicBool,
    statistics: Arc<Statistics>,
}

/// Executes every transaction one at a time on a single thread, in block then index order. This
/// is the reference every other protocol is compared against.
pub struct Serial {
    shared: Arc<Shared>,
    blocks: Vec<Block>,
    lifecycle: Lifecycle,
}

impl Serial {
    pub const NAME: &'static str = "Serial";

    pub fn new(blocks: Vec<Block>, statistics: Arc<Statistics>, table_partitions: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Table::new(table_partitions),
                stop: AtomicBool::new(false),
                statistics,
            }),
            blocks,
            lifecycle: Lifecycle::Idle,
        }
    }
}

impl Shared {
    fn run(&self, blocks: Vec<Block>) {
        for block in blocks {
            for txn in block.txns() {
                if self.stop.load(Ordering::Acquire) {
                    info!(protocol = Serial::NAME, block = block.id(), "stopping");
                    return;
                }
                let started = Instant::now();
                let mut rw = RwSet::default();
                txn.execute(&mut BufferedView::new(&mut rw, |key: &str| {
                    self.table.get(key, |value| value.clone())
                }));
                for (key, value) in rw.writes {
                    self.table.put(&key, |entry| *entry = value);
                }
                self.statistics.journal_execute();
                self.statistics.journal_overheads(txn.cost());
                self.statistics
                    .journal_commit(started.elapsed().as_micros() as u64);
            }
            self.statistics.journal_block();
        }
    }
}

impl Protocol for Serial {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn start(&mut self) -> ExecutorResult<()> {
        self.lifecycle.ensure_idle(Self::NAME)?;
        let blocks = std::mem::take(&mut self.blocks);
        let shared = self.shared.clone();
        let handle = spawn_named("serial-worker".into(), Some(0), move || shared.run(blocks))?;
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
        collect_values(&self.shared.table, |value| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        proptest_types::{blocks_strategy, computed_blocks, run_to_completion, serial_outcome},
        txn::FnTransaction,
    };
    use proptest::prelude::*;

    #[test]
    fn later_transactions_observe_earlier_commits() {
        let increment = || {
            Arc::new(FnTransaction::new(|view| {
                let next = view.get("counter").parse::<u64>().unwrap_or(0) + 1;
                view.put("counter", next.to_string());
            })) as Arc<dyn crate::txn::Transaction>
        };
        let blocks = vec![
            Block::new(0, vec![increment(), increment()]),
            Block::new(1, vec![increment()]),
        ];
        let stats = Arc::new(Statistics::new("serial-counter"));
        let mut serial = Serial::new(blocks, stats.clone(), 2);
        let snapshot = run_to_completion(&mut serial);
        assert_eq!(snapshot.get("counter").map(String::as_str), Some("3"));
        assert_eq!(stats.commits(), 3);
        assert_eq!(stats.blocks(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn serial_matches_baseline(specs in blocks_strategy(10, 3, 3, 10, 3)) {
            let blocks = computed_blocks(&specs);
            let expected = serial_outcome(&blocks);
            let mut serial = Serial::new(blocks, Arc::new(Statistics::new("serial-prop")), 3);
            prop_assert_eq!(run_to_completion(&mut serial), expected);
        }
    }
}
