// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::BTreeMap,
    fmt,
    hint::black_box,
    sync::Arc,
};

/// Position of a transaction inside its block, starting at 0. Lower index means earlier in the
/// block's preset serialization order.
pub type TxnIndex = usize;

pub type Key = String;

/// Values are opaque strings. The empty string stands for "absent".
pub type Value = String;

/// Number of busy-loop iterations burned per unit of simulated cost.
const SPINS_PER_COST_UNIT: u64 = 64;

/// Burns CPU proportionally to `units`, standing in for real transaction logic.
pub fn simulate_cost(units: u64) {
    let mut acc = 0u64;
    for i in 0..units.saturating_mul(SPINS_PER_COST_UNIT) {
        acc = black_box(acc.wrapping_add(i));
    }
    black_box(acc);
}

/// The storage interface a transaction body sees while executing. Every protocol installs its own
/// implementation: some buffer writes locally, some read and write the shared table directly.
pub trait StorageView {
    fn get(&mut self, key: &str) -> Value;

    fn put(&mut self, key: &str, value: Value);
}

/// A unit of work submitted to a protocol. Implementations must be deterministic functions of the
/// values they read, since protocols may execute a transaction several times.
pub trait Transaction: Send + Sync + 'static {
    fn execute(&self, view: &mut dyn StorageView);

    /// Simulated execution cost, journaled as overhead and used as the rollback weight by Loom.
    fn cost(&self) -> u64 {
        0
    }

    /// The nested structure of the transaction, if it has one.
    fn root(&self) -> Option<&SubTransaction> {
        None
    }
}

/// Keys a transaction read (with the value observed) and wrote (with the value written) during
/// its latest execution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RwSet {
    pub reads: BTreeMap<Key, Value>,
    pub writes: BTreeMap<Key, Value>,
}

impl RwSet {
    pub fn clear(&mut self) {
        self.reads.clear();
        self.writes.clear();
    }

    pub fn read_keys(&self) -> impl Iterator<Item = &Key> {
        self.reads.keys()
    }

    pub fn write_keys(&self) -> impl Iterator<Item = &Key> {
        self.writes.keys()
    }

    /// True if the two footprints touch a common key with at least one of them writing it.
    pub fn conflicts_with(&self, other: &RwSet) -> bool {
        self.writes
            .keys()
            .any(|k| other.writes.contains_key(k) || other.reads.contains_key(k))
            || self.reads.keys().any(|k| other.writes.contains_key(k))
    }
}

/// View that serves reads through `read` and buffers every write in the read-write set. Reads
/// observe the transaction's own earlier writes, and repeated reads of a key return the value
/// observed the first time.
pub struct BufferedView<'a, R> {
    rw: &'a mut RwSet,
    read: R,
}

impl<'a, R: FnMut(&str) -> Value> BufferedView<'a, R> {
    pub fn new(rw: &'a mut RwSet, read: R) -> Self {
        Self { rw, read }
    }
}

impl<R: FnMut(&str) -> Value> StorageView for BufferedView<'_, R> {
    fn get(&mut self, key: &str) -> Value {
        if let Some(value) = self.rw.writes.get(key) {
            return value.clone();
        }
        if let Some(value) = self.rw.reads.get(key) {
            return value.clone();
        }
        let value = (self.read)(key);
        self.rw.reads.insert(key.to_owned(), value.clone());
        value
    }

    fn put(&mut self, key: &str, value: Value) {
        self.rw.writes.insert(key.to_owned(), value);
    }
}

/// View that reads and writes the live state through the supplied closures, recording the
/// footprint as it goes. Used by pessimistic (already ordered) execution paths.
pub struct DirectView<'a, R, W> {
    rw: &'a mut RwSet,
    read: R,
    write: W,
}

impl<'a, R, W> DirectView<'a, R, W>
where
    R: FnMut(&str) -> Value,
    W: FnMut(&str, &Value),
{
    pub fn new(rw: &'a mut RwSet, read: R, write: W) -> Self {
        Self { rw, read, write }
    }
}

impl<R, W> StorageView for DirectView<'_, R, W>
where
    R: FnMut(&str) -> Value,
    W: FnMut(&str, &Value),
{
    fn get(&mut self, key: &str) -> Value {
        let value = (self.read)(key);
        if !self.rw.writes.contains_key(key) {
            self.rw.reads.entry(key.to_owned()).or_insert_with(|| value.clone());
        }
        value
    }

    fn put(&mut self, key: &str, value: Value) {
        (self.write)(key, &value);
        self.rw.writes.insert(key.to_owned(), value);
    }
}

/// Reads every key of `reads`, then writes `value` to every key of `writes`.
#[derive(Clone, Debug, Default)]
pub struct RwTransaction {
    pub reads: Vec<Key>,
    pub writes: Vec<Key>,
    pub value: Value,
    pub cost: u64,
}

impl RwTransaction {
    pub fn new(reads: Vec<Key>, writes: Vec<Key>, value: impl Into<Value>) -> Self {
        Self {
            reads,
            writes,
            value: value.into(),
            cost: 0,
        }
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }
}

impl Transaction for RwTransaction {
    fn execute(&self, view: &mut dyn StorageView) {
        for key in &self.reads {
            view.get(key);
        }
        for key in &self.writes {
            view.put(key, self.value.clone());
        }
        simulate_cost(self.cost);
    }

    fn cost(&self) -> u64 {
        self.cost
    }
}

/// One node of a nested transaction.
#[derive(Clone, Debug, Default)]
pub struct SubTransaction {
    pub reads: Vec<Key>,
    pub writes: Vec<Key>,
    pub value: Value,
    pub cost: u64,
    pub children: Vec<SubTransaction>,
}

impl SubTransaction {
    pub fn leaf(reads: Vec<Key>, writes: Vec<Key>, value: impl Into<Value>) -> Self {
        Self {
            reads,
            writes,
            value: value.into(),
            cost: 0,
            children: vec![],
        }
    }

    pub fn with_children(mut self, children: Vec<SubTransaction>) -> Self {
        self.children = children;
        self
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Runs only this node's own body, without its children.
    pub fn execute_local(&self, view: &mut dyn StorageView) {
        for key in &self.reads {
            view.get(key);
        }
        for key in &self.writes {
            view.put(key, self.value.clone());
        }
        simulate_cost(self.cost);
    }

    /// Depth-first execution: every child subtree first, then the node itself.
    pub fn execute_tree(&self, view: &mut dyn StorageView) {
        for child in &self.children {
            child.execute_tree(view);
        }
        self.execute_local(view);
    }

    pub fn total_cost(&self) -> u64 {
        self.cost + self.children.iter().map(|c| c.total_cost()).sum::<u64>()
    }

    pub fn num_nodes(&self) -> usize {
        1 + self.children.iter().map(|c| c.num_nodes()).sum::<usize>()
    }

    /// Nodes in depth-first post-order (the execution order), each with its child-index path
    /// from the root.
    pub fn post_order(&self) -> Vec<(Vec<u16>, &SubTransaction)> {
        let mut out = Vec::with_capacity(self.num_nodes());
        self.collect_post_order(&mut vec![], &mut out);
        out
    }

    fn collect_post_order<'a>(
        &'a self,
        path: &mut Vec<u16>,
        out: &mut Vec<(Vec<u16>, &'a SubTransaction)>,
    ) {
        for (i, child) in self.children.iter().enumerate() {
            path.push(i as u16);
            child.collect_post_order(path, out);
            path.pop();
        }
        out.push((path.clone(), self));
    }
}

/// A transaction made of a tree of sub-transactions.
#[derive(Clone, Debug)]
pub struct NestedTransaction {
    root: SubTransaction,
}

impl NestedTransaction {
    pub fn new(root: SubTransaction) -> Self {
        Self { root }
    }
}

impl Transaction for NestedTransaction {
    fn execute(&self, view: &mut dyn StorageView) {
        self.root.execute_tree(view);
    }

    fn cost(&self) -> u64 {
        self.root.total_cost()
    }

    fn root(&self) -> Option<&SubTransaction> {
        Some(&self.root)
    }
}

type TxnBody = dyn Fn(&mut dyn StorageView) + Send + Sync;

/// A transaction whose body is an arbitrary closure, e.g. writes computed from reads.
pub struct FnTransaction {
    body: Box<TxnBody>,
    cost: u64,
}

impl FnTransaction {
    pub fn new(body: impl Fn(&mut dyn StorageView) + Send + Sync + 'static) -> Self {
        Self {
            body: Box::new(body),
            cost: 0,
        }
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }
}

impl fmt::Debug for FnTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTransaction")
            .field("cost", &self.cost)
            .finish_non_exhaustive()
    }
}

impl Transaction for FnTransaction {
    fn execute(&self, view: &mut dyn StorageView) {
        (self.body)(view);
        simulate_cost(self.cost);
    }

    fn cost(&self) -> u64 {
        self.cost
    }
}

/// An ordered batch of transactions. Blocks are executed in the order they are handed to a
/// protocol, and transactions within a block are ordered by their position.
#[derive(Clone)]
pub struct Block {
    id: u64,
    txns: Vec<Arc<dyn Transaction>>,
}

impl Block {
    pub fn new(id: u64, txns: Vec<Arc<dyn Transaction>>) -> Self {
        Self { id, txns }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn txns(&self) -> &[Arc<dyn Transaction>] {
        &self.txns
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("len", &self.txns.len())
            .finish()
    }
}
