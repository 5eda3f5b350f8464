// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    schedule::{conflict_free_waves, execute_in_waves},
    txn::{BufferedView, Key, RwSet, StorageView, SubTransaction, Transaction, TxnIndex, Value},
};
use hashbrown::HashMap;
use std::{
    collections::BTreeSet,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Keys one sub-transaction read and the writes it produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeRecord {
    pub reads: BTreeSet<Key>,
    pub writes: Vec<(Key, Value)>,
}

/// Result of pre-executing one transaction: its buffered read-write set and, for nested
/// transactions, one record per sub-transaction in post-order.
#[derive(Debug, Default)]
pub struct Footprint {
    pub rw: RwSet,
    pub nodes: Vec<NodeRecord>,
}

struct RecordingView<'a> {
    inner: &'a mut dyn StorageView,
    record: &'a mut NodeRecord,
}

impl StorageView for RecordingView<'_> {
    fn get(&mut self, key: &str) -> Value {
        self.record.reads.insert(key.to_owned());
        self.inner.get(key)
    }

    fn put(&mut self, key: &str, value: Value) {
        self.record.writes.push((key.to_owned(), value.clone()));
        self.inner.put(key, value);
    }
}

/// Executes `txn` with reads served by `read`, buffering its writes.
pub fn record(txn: &dyn Transaction, read: impl FnMut(&str) -> Value) -> Footprint {
    let mut rw = RwSet::default();
    let mut nodes = vec![];
    {
        let mut view = BufferedView::new(&mut rw, read);
        match txn.root() {
            Some(root) => {
                for (_, node) in root.post_order() {
                    let mut record = NodeRecord::default();
                    node.execute_local(&mut RecordingView {
                        inner: &mut view,
                        record: &mut record,
                    });
                    nodes.push(record);
                }
            },
            None => txn.execute(&mut view),
        }
    }
    Footprint { rw, nodes }
}

/// Re-runs only the sub-transactions of `root` whose reads may have changed since they were
/// recorded: a read is dirty if `is_dirty` says so, or if a re-run earlier node of the same
/// transaction wrote the key. Clean nodes replay their recorded writes. Returns the number of
/// nodes that ran again.
pub fn replay_nested(
    root: &SubTransaction,
    records: &[NodeRecord],
    view: &mut dyn StorageView,
    is_dirty: impl Fn(&str) -> bool,
) -> usize {
    let mut locally_dirty: BTreeSet<Key> = BTreeSet::new();
    let mut rerun = 0;
    for ((_, node), record) in root.post_order().into_iter().zip(records) {
        let dirty = record
            .reads
            .iter()
            .any(|key| is_dirty(key) || locally_dirty.contains(key));
        if dirty {
            let mut fresh = NodeRecord::default();
            node.execute_local(&mut RecordingView {
                inner: &mut *view,
                record: &mut fresh,
            });
            locally_dirty.extend(fresh.writes.into_iter().map(|(key, _)| key));
            rerun += 1;
        } else {
            for (key, value) in &record.writes {
                view.put(key, value.clone());
            }
        }
    }
    rerun
}

/// What the deterministic re-execution of a block's rolled-back transactions produced.
#[derive(Debug, Default)]
pub struct ReExecution {
    pub waves: usize,
    pub replayed_nodes: usize,
    pub rerun_nodes: usize,
}

/// Re-executes `rolled_back` (ascending indices) after the rest of the block committed. The
/// transactions are scheduled into conflict-free waves in index order using their recorded
/// footprints and run against the live state through `read`; `write` installs their writes.
///
/// With `nested` set, nested transactions re-run only their dirty sub-transactions. A key is
/// dirty for a transaction if it is in `committed_keys` or an earlier rolled-back transaction
/// wrote it.
pub fn deterministic_re_execute(
    txns: &[&dyn Transaction],
    footprints: &[&Footprint],
    rolled_back: &[TxnIndex],
    committed_keys: &BTreeSet<Key>,
    nested: bool,
    read: impl Fn(&str) -> Value + Sync,
    mut write: impl FnMut(&str, Value),
) -> ReExecution {
    let rws: Vec<&RwSet> = rolled_back.iter().map(|&idx| &footprints[idx].rw).collect();
    let waves = conflict_free_waves(&rws);

    let mut first_writer: HashMap<&str, usize> = HashMap::new();
    for (pos, rw) in rws.iter().enumerate() {
        for key in rw.write_keys() {
            first_writer.entry(key.as_str()).or_insert(pos);
        }
    }

    let rerun = AtomicUsize::new(0);
    let replayed = AtomicUsize::new(0);
    execute_in_waves(
        &waves,
        read,
        |pos, view| {
            let idx = rolled_back[pos];
            match txns[idx].root() {
                Some(root) if nested => {
                    let nodes = &footprints[idx].nodes;
                    let ran = replay_nested(root, nodes, view, |key| {
                        committed_keys.contains(key)
                            || first_writer.get(key).is_some_and(|&writer| writer < pos)
                    });
                    rerun.fetch_add(ran, Ordering::Relaxed);
                    replayed.fetch_add(nodes.len() - ran, Ordering::Relaxed);
                },
                _ => txns[idx].execute(view),
            }
        },
        |_, rw| {
            for (key, value) in rw.writes {
                write(&key, value);
            }
        },
    );

    ReExecution {
        waves: waves.len(),
        replayed_nodes: replayed.into_inner(),
        rerun_nodes: rerun.into_inner(),
    }
}
