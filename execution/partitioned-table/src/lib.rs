// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crossbeam::utils::CachePadded;
use fxhash::{FxBuildHasher, FxHasher};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::{
    borrow::Borrow,
    hash::{Hash, Hasher},
};

#[cfg(test)]
mod unit_tests;

type Partition<K, V> = CachePadded<Mutex<HashMap<K, V, FxBuildHasher>>>;

/// Main shared data-structure used by protocol workers to read and update per-key entries.
///
/// Keys are spread over a fixed number of partitions by `hash(key) % partitions`, and every
/// access holds the partition lock for the duration of the supplied closure. Hence, a closure
/// has exclusive access to its entry (and to all other entries of the same partition), but
/// nothing is atomic across keys. Entries are default-constructed on first touch, so callers
/// never need a separate existence check.
///
/// The number of partitions trades lock contention for memory and cache locality.
pub struct Table<K, V> {
    partitions: Vec<Partition<K, V>>,
}

impl<K: Hash + Eq, V: Default> Table<K, V> {
    /// Creates a table with `num_partitions` partitions (at least one).
    pub fn new(num_partitions: usize) -> Self {
        let partitions = (0..num_partitions.max(1))
            .map(|_| CachePadded::new(Mutex::new(HashMap::with_hasher(FxBuildHasher::default()))))
            .collect();
        Self { partitions }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Index of the partition owning `key`. Deterministic across runs.
    pub fn partition_of<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    /// Applies `mutator` to the entry of `key` under the partition lock, default-constructing
    /// the entry if the key was never touched, and returns whatever the mutator returns.
    pub fn put<Q, R>(&self, key: &Q, mutator: impl FnOnce(&mut V) -> R) -> R
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let mut partition = self.partitions[self.partition_of(key)].lock();
        if let Some(entry) = partition.get_mut(key) {
            return mutator(entry);
        }
        mutator(partition.entry(key.to_owned()).or_default())
    }

    /// Read-only access to the entry of `key`. Like `put`, a missing entry is default-constructed
    /// first, so a read leaves a (default) footprint in the table.
    pub fn get<Q, R>(&self, key: &Q, reader: impl FnOnce(&V) -> R) -> R
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        self.put(key, |entry| reader(entry))
    }

    /// Read-only access without inserting. Returns None if `key` was never touched.
    pub fn try_get<Q, R>(&self, key: &Q, reader: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let partition = self.partitions[self.partition_of(key)].lock();
        partition.get(key).map(reader)
    }

    /// Visits every entry, one partition at a time. Entries of a partition are observed
    /// atomically with respect to each other, but not across partitions.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for partition in &self.partitions {
            for (key, entry) in partition.lock().iter() {
                f(key, entry);
            }
        }
    }

    /// Number of materialized entries.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
