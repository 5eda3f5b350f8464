// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Moss: nested transactions committed strictly in index order.
//!
//! Every transaction is a tree of sub-transactions executed in post-order. Reads and writes go
//! straight to shared per-key entries that remember which sub-transactions read the key and which
//! transaction currently owns its (uncommitted) write slot:
//!
//! * a read of a key owned by an earlier transaction cannot proceed, the reading sub-transaction
//!   is marked and re-executed once that owner has finalized;
//! * a write marks every reader ordered after the writer, and either joins, steals from a later
//!   owner (marking the owner's writing sub-transactions) or, if an earlier transaction owns the
//!   slot, marks the writer itself.
//!
//! A transaction keeps re-executing its marked subtrees until it is unmarked when its turn comes;
//! it then installs its latest write of every key it owns and clears its footprint.

mod war;

pub use war::{MossTxnState, NodeRef, NodeSpan, SubTxnId, WarSet};

use crate::{
    arena::BlockArena,
    errors::ExecutorResult,
    protocol::{Lifecycle, Protocol, spawn_named},
    statistics::Statistics,
    sync::{SpinLock, TurnSequencer},
    thread_pool::ThreadPool,
    txn::{Block, Key, StorageView, SubTransaction, Transaction, TxnIndex, Value},
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

#[derive(Default)]
struct EntryState {
    value: Value,
    readers: Vec<NodeRef>,
    owner: Option<TxnIndex>,
    // Uncommitted writes of `owner`, by post-order position of the writing node.
    pending: BTreeMap<usize, (NodeSpan, Value)>,
}

/// Shared per-key record. The table's partition lock is only held to find the entry; the
/// record itself is guarded by its own spin lock.
#[derive(Default)]
pub struct MossEntry {
    state: SpinLock<EntryState>,
}

struct Shared {
    table: Table<Key, Arc<MossEntry>>,
    stop: AtomicBool,
    statistics: Arc<Statistics>,
}

impl Shared {
    fn entry(&self, key: &str) -> Arc<MossEntry> {
        self.table.get(key, |entry| entry.clone())
    }
}

/// Per-block coordination: mark state of every transaction and the finalize order.
struct BlockRun {
    arena: BlockArena<MossTxnState>,
    sequencer: TurnSequencer,
}

impl BlockRun {
    fn new(batch_id: u64, num_txns: usize) -> Self {
        Self {
            arena: BlockArena::new(batch_id, num_txns, |_| MossTxnState::default()),
            sequencer: TurnSequencer::new(0),
        }
    }

    fn mark(&self, node: NodeRef, blocked_on: Option<TxnIndex>) {
        self.arena
            .slot(node.txn)
            .state
            .set_war(node.span, blocked_on);
        self.sequencer.wake();
    }
}

enum NodeBody<'a> {
    Sub(&'a SubTransaction),
    Whole(&'a dyn Transaction),
}

struct MossNode<'a> {
    span: NodeSpan,
    path: Vec<u16>,
    body: NodeBody<'a>,
}

impl MossNode<'_> {
    fn execute(&self, view: &mut dyn StorageView) {
        match self.body {
            NodeBody::Sub(sub) => sub.execute_local(view),
            NodeBody::Whole(txn) => txn.execute(view),
        }
    }

    fn cost(&self) -> u64 {
        match self.body {
            NodeBody::Sub(sub) => sub.cost,
            NodeBody::Whole(txn) => txn.cost(),
        }
    }
}

fn build_nodes(txn: &dyn Transaction) -> Vec<MossNode<'_>> {
    match txn.root() {
        Some(root) => root
            .post_order()
            .into_iter()
            .enumerate()
            .map(|(order, (path, sub))| MossNode {
                span: NodeSpan {
                    first: order + 1 - sub.num_nodes(),
                    order,
                },
                path,
                body: NodeBody::Sub(sub),
            })
            .collect(),
        None => vec![MossNode {
            span: NodeSpan { first: 0, order: 0 },
            path: vec![],
            body: NodeBody::Whole(txn),
        }],
    }
}

#[derive(Default)]
struct Footprint {
    reads: BTreeSet<Key>,
    writes: BTreeSet<Key>,
}

struct MossView<'a> {
    shared: &'a Shared,
    block: &'a BlockRun,
    me: NodeRef,
    footprint: &'a mut Footprint,
}

impl StorageView for MossView<'_> {
    fn get(&mut self, key: &str) -> Value {
        let entry = self.shared.entry(key);
        let (value, blocked_by) = {
            let mut state = entry.state.lock();
            let owner = state.owner;
            match owner {
                Some(owner) if owner < self.me.txn => (state.value.clone(), Some(owner)),
                owner => {
                    let own_write = (owner == Some(self.me.txn))
                        .then(|| state.pending.range(..=self.me.span.order).next_back())
                        .flatten()
                        .map(|(_, (_, value))| value.clone());
                    let value = own_write.unwrap_or_else(|| state.value.clone());
                    if !state.readers.contains(&self.me) {
                        state.readers.push(self.me);
                    }
                    (value, None)
                },
            }
        };
        match blocked_by {
            Some(owner) => self.block.mark(self.me, Some(owner)),
            None => {
                self.footprint.reads.insert(key.to_owned());
            },
        }
        value
    }

    fn put(&mut self, key: &str, value: Value) {
        let entry = self.shared.entry(key);
        let mut to_mark = vec![];
        let installed = {
            let mut state = entry.state.lock();
            let me = self.me;
            to_mark.extend(
                state
                    .readers
                    .iter()
                    .filter(|reader| reader.is_after(me.txn, me.span.order))
                    .map(|reader| (*reader, None)),
            );
            let owner = state.owner;
            match owner {
                Some(owner) if owner < me.txn => {
                    to_mark.push((me, Some(owner)));
                    false
                },
                Some(owner) if owner > me.txn => {
                    to_mark.extend(
                        state
                            .pending
                            .values()
                            .map(|(span, _)| (NodeRef { txn: owner, span: *span }, None)),
                    );
                    state.pending.clear();
                    state.owner = Some(me.txn);
                    state.pending.insert(me.span.order, (me.span, value));
                    true
                },
                _ => {
                    state.owner = Some(me.txn);
                    state.pending.insert(me.span.order, (me.span, value));
                    true
                },
            }
        };
        if installed {
            self.footprint.writes.insert(key.to_owned());
        }
        for (node, blocked_on) in to_mark {
            self.block.mark(node, blocked_on);
        }
    }
}

/// Execution of one transaction of a block, from first run to finalize.
struct TxnRun<'a> {
    shared: &'a Shared,
    block: &'a BlockRun,
    index: TxnIndex,
    nodes: Vec<MossNode<'a>>,
    footprints: Vec<Footprint>,
    reexecuted: Vec<usize>,
    started: Instant,
}

impl<'a> TxnRun<'a> {
    fn new(shared: &'a Shared, block: &'a BlockRun, index: TxnIndex, txn: &'a dyn Transaction) -> Self {
        let nodes = build_nodes(txn);
        let footprints = nodes.iter().map(|_| Footprint::default()).collect();
        Self {
            shared,
            block,
            index,
            nodes,
            footprints,
            reexecuted: vec![],
            started: Instant::now(),
        }
    }

    fn run(mut self) {
        self.execute_all();
        self.settle();
    }

    fn execute_all(&mut self) {
        for order in 0..self.nodes.len() {
            self.execute_node(order);
        }
        let cost = self.nodes.iter().map(MossNode::cost).sum();
        self.shared.statistics.journal_execute();
        self.shared.statistics.journal_overheads(cost);
    }

    fn execute_node(&mut self, order: usize) {
        let node = &self.nodes[order];
        let mut view = MossView {
            shared: self.shared,
            block: self.block,
            me: NodeRef {
                txn: self.index,
                span: node.span,
            },
            footprint: &mut self.footprints[order],
        };
        node.execute(&mut view);
    }

    /// Removes every trace `order` left in the table.
    fn clear_node(&mut self, order: usize) {
        let footprint = std::mem::take(&mut self.footprints[order]);
        for key in footprint.reads {
            let entry = self.shared.entry(&key);
            entry
                .state
                .lock()
                .readers
                .retain(|reader| reader.txn != self.index || reader.span.order != order);
        }
        for key in footprint.writes {
            let entry = self.shared.entry(&key);
            let mut state = entry.state.lock();
            if state.owner == Some(self.index) {
                state.pending.remove(&order);
                if state.pending.is_empty() {
                    state.owner = None;
                }
            }
        }
    }

    /// Re-executes marked subtrees until the transaction is unmarked at its turn, then finalizes.
    fn settle(&mut self) {
        let block = self.block;
        let state = &block.arena.slot(self.index).state;
        loop {
            if state.is_marked() {
                let war = state.take();
                if let Some(writer) = war.blocked_on() {
                    self.block.sequencer.wait_finished(writer);
                }
                let orders = war.orders();
                debug!(
                    txn = self.index,
                    nodes = ?orders
                        .iter()
                        .map(|&o| SubTxnId { txn: self.index, path: &self.nodes[o].path }.to_string())
                        .collect::<Vec<_>>(),
                    "re-executing marked sub-transactions"
                );
                for &order in &orders {
                    self.clear_node(order);
                }
                let mut wasted = 0;
                for &order in &orders {
                    self.execute_node(order);
                    wasted += self.nodes[order].cost();
                }
                self.reexecuted.extend(orders);
                self.shared.statistics.journal_execute();
                self.shared.statistics.journal_rollback(wasted);
                self.shared.statistics.journal_overheads(wasted);
                continue;
            }
            if self
                .block
                .sequencer
                .wait_for_turn_or(self.index, || state.is_marked())
            {
                self.finalize();
                self.block.sequencer.advance();
                return;
            }
        }
    }

    fn finalize(&mut self) {
        let mut reads = BTreeSet::new();
        let mut writes = BTreeSet::new();
        for footprint in self.footprints.iter_mut() {
            reads.append(&mut footprint.reads);
            writes.append(&mut footprint.writes);
        }
        for key in writes {
            let entry = self.shared.entry(&key);
            let mut state = entry.state.lock();
            if state.owner == Some(self.index) {
                if let Some((_, (_, value))) = state.pending.last_key_value() {
                    state.value = value.clone();
                }
                state.pending.clear();
                state.owner = None;
            }
        }
        for key in reads {
            let entry = self.shared.entry(&key);
            entry
                .state
                .lock()
                .readers
                .retain(|reader| reader.txn != self.index);
        }
        self.shared
            .statistics
            .journal_commit(self.started.elapsed().as_micros() as u64);
    }
}

/// Nested-transaction protocol with index-order finalize.
pub struct Moss {
    shared: Arc<Shared>,
    blocks: Vec<Block>,
    num_threads: usize,
    lifecycle: Lifecycle,
}

impl Moss {
    pub const NAME: &'static str = "Moss";

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
}

impl Shared {
    fn run(self: Arc<Self>, pool: ThreadPool, blocks: Vec<Block>) {
        for (pos, block) in blocks.into_iter().enumerate() {
            if self.stop.load(Ordering::Acquire) {
                info!(protocol = Moss::NAME, block = block.id(), "stopping");
                break;
            }
            let run = Arc::new(BlockRun::new(pos as u64 + 1, block.len()));
            let mut handles = Vec::with_capacity(block.len());
            // Submission in index order: every running task only waits on earlier ones.
            for (index, txn) in block.txns().iter().enumerate() {
                let shared = self.clone();
                let run = run.clone();
                let txn = txn.clone();
                let spawned = pool.spawn(move || {
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        TxnRun::new(&shared, &run, index, txn.as_ref()).run()
                    }));
                    if let Err(payload) = result {
                        // Keep later transactions from waiting forever on this turn.
                        run.sequencer.wait_for_turn_or(index, || false);
                        run.sequencer.advance();
                        resume_unwind(payload);
                    }
                });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => error!(protocol = Moss::NAME, error = %err, "failed to submit"),
                }
            }
            for handle in handles {
                if let Err(err) = handle.join() {
                    error!(protocol = Moss::NAME, error = %err, "transaction task failed");
                }
            }
            self.statistics.journal_block();
        }
        pool.shutdown();
    }
}

impl Protocol for Moss {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn start(&mut self) -> ExecutorResult<()> {
        self.lifecycle.ensure_idle(Self::NAME)?;
        let pool = ThreadPool::new("moss-pool", self.num_threads, true)?;
        let blocks = std::mem::take(&mut self.blocks);
        let shared = self.shared.clone();
        let handle = spawn_named("moss-driver".into(), None, move || shared.run(pool, blocks))?;
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
        let mut snapshot = BTreeMap::new();
        self.shared.table.for_each(|key, entry| {
            let state = entry.state.lock();
            if !state.value.is_empty() {
                snapshot.insert(key.clone(), state.value.clone());
            }
        });
        snapshot
    }
}
