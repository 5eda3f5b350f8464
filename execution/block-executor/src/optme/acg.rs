// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::txn::{Key, RwSet, TxnIndex};
use itertools::Itertools;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// One read or write of an address by a transaction. `degree` counts the accesses of the same
/// transaction to other addresses it is cross-dependent with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unit {
    pub txn: TxnIndex,
    pub degree: u32,
    /// The transaction both reads and writes this address.
    pub co_located: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Address {
    pub in_degree: u32,
    pub out_degree: u32,
    pub reads: Vec<Unit>,
    pub writes: Vec<Unit>,
    pub read_max_seq: u32,
    pub first_updater: bool,
}

impl Address {
    fn merge(&mut self, other: Address) {
        self.in_degree += other.in_degree;
        self.out_degree += other.out_degree;
        self.reads.extend(other.reads);
        self.writes.extend(other.writes);
        self.first_updater |= other.first_updater;
    }
}

type Addresses = BTreeMap<Key, Address>;

/// Address-based conflict graph of a simulated block: per address, the read and write units of
/// the transactions touching it. Sorting assigns every transaction a sequence number; the
/// transactions that cannot be given a consistent one are aborted.
#[derive(Debug)]
pub struct ConflictGraph {
    addresses: Addresses,
    sequences: Vec<u32>,
    aborted: Vec<bool>,
}

fn co_located_keys(rw: &RwSet) -> impl Iterator<Item = &Key> {
    rw.write_keys().filter(|key| rw.reads.contains_key(*key))
}

/// Keeps the first transaction (by index) that updates an address and aborts every later one.
fn first_updaters(footprints: &[&RwSet]) -> Vec<bool> {
    let mut updated: BTreeSet<&Key> = BTreeSet::new();
    footprints
        .iter()
        .map(|rw| {
            if co_located_keys(rw).any(|key| updated.contains(key)) {
                true
            } else {
                updated.extend(co_located_keys(rw));
                false
            }
        })
        .collect()
}

fn add_units(addresses: &mut Addresses, txn: TxnIndex, rw: &RwSet) {
    for key in rw.read_keys() {
        let degree = rw.write_keys().filter(|written| *written != key).count() as u32;
        let address = addresses.entry(key.clone()).or_default();
        address.in_degree += degree;
        address.reads.push(Unit {
            txn,
            degree,
            co_located: false,
        });
    }
    for key in rw.write_keys() {
        let degree = rw.read_keys().filter(|read| *read != key).count() as u32;
        let co_located = rw.reads.contains_key(key);
        let address = addresses.entry(key.clone()).or_default();
        address.out_degree += degree;
        address.first_updater |= co_located;
        address.writes.push(Unit {
            txn,
            degree,
            co_located,
        });
    }
}

impl ConflictGraph {
    fn empty(num_txns: usize, aborted: Vec<bool>) -> Self {
        debug_assert_eq!(aborted.len(), num_txns);
        Self {
            addresses: Addresses::new(),
            sequences: vec![0; num_txns],
            aborted,
        }
    }

    /// Builds the graph from the footprints, given in index order.
    pub fn construct(footprints: &[&RwSet]) -> Self {
        let mut graph = Self::empty(footprints.len(), first_updaters(footprints));
        for (txn, rw) in footprints.iter().enumerate() {
            if !graph.aborted[txn] {
                add_units(&mut graph.addresses, txn, rw);
            }
        }
        graph
    }

    /// Same graph as `construct`: chunks of `max(n / num_threads, 1)` transactions are turned
    /// into partial graphs in parallel, which are then merged pairwise in order.
    pub fn parallel_construct(footprints: &[&RwSet], num_threads: usize) -> Self {
        let mut graph = Self::empty(footprints.len(), first_updaters(footprints));
        let chunk_size = (footprints.len() / num_threads.max(1)).max(1);
        let indexed: Vec<(TxnIndex, &RwSet)> = footprints
            .iter()
            .enumerate()
            .filter(|(txn, _)| !graph.aborted[*txn])
            .map(|(txn, rw)| (txn, *rw))
            .collect();

        let mut partials: Vec<Addresses> = indexed
            .par_chunks(chunk_size)
            .map(|chunk| {
                let mut addresses = Addresses::new();
                for (txn, rw) in chunk {
                    add_units(&mut addresses, *txn, rw);
                }
                addresses
            })
            .collect();
        while partials.len() > 1 {
            let mut pending = partials.into_iter();
            let mut merged = vec![];
            while let Some(mut left) = pending.next() {
                if let Some(right) = pending.next() {
                    for (key, address) in right {
                        left.entry(key).or_default().merge(address);
                    }
                }
                merged.push(left);
            }
            partials = merged;
        }
        graph.addresses = partials.pop().unwrap_or_default();
        graph
    }

    /// Addresses by in-degree descending, then out-degree ascending, then key.
    pub fn address_rank(&self) -> Vec<Key> {
        let mut ranked: Vec<(&Key, &Address)> = self.addresses.iter().collect();
        ranked.sort_by(|(a_key, a), (b_key, b)| {
            b.in_degree
                .cmp(&a.in_degree)
                .then(a.out_degree.cmp(&b.out_degree))
                .then(a_key.cmp(b_key))
        });
        ranked.into_iter().map(|(key, _)| key.clone()).collect()
    }

    /// Assigns sequence numbers address by address in rank order.
    pub fn hierarchical_sort(&mut self) {
        for key in self.address_rank() {
            let Some(mut address) = self.addresses.remove(&key) else {
                continue;
            };
            self.sort_reads(&mut address);
            self.sort_writes(&mut address);
            self.addresses.insert(key, address);
        }
    }

    fn sort_reads(&mut self, address: &mut Address) {
        let (sorted, remaining): (Vec<_>, Vec<_>) = address
            .reads
            .drain(..)
            .partition(|unit| self.sequences[unit.txn] > 0);
        address.read_max_seq = sorted
            .iter()
            .map(|unit| self.sequences[unit.txn])
            .max()
            .unwrap_or(1);
        for unit in &remaining {
            self.sequences[unit.txn] = address.read_max_seq;
        }
        address.reads = sorted;
        address.reads.extend(remaining);
    }

    fn sort_writes(&mut self, address: &mut Address) {
        let (sorted, remaining): (Vec<_>, Vec<_>) = address
            .writes
            .drain(..)
            .partition(|unit| self.sequences[unit.txn] > 0);
        let read_max = address.read_max_seq;

        let mut first_taken = false;
        for unit in sorted.iter().filter(|unit| unit.co_located) {
            if self.aborted[unit.txn] {
                continue;
            }
            if first_taken {
                self.aborted[unit.txn] = true;
            } else {
                self.sequences[unit.txn] = read_max + 1;
                first_taken = true;
            }
        }
        for unit in &sorted {
            if !self.aborted[unit.txn] && self.sequences[unit.txn] < read_max {
                self.aborted[unit.txn] = true;
            }
        }

        let mut used: BTreeSet<u32> = sorted.iter().map(|unit| self.sequences[unit.txn]).collect();
        let mut next = read_max + 1;
        for unit in &remaining {
            while used.contains(&next) {
                next += 1;
            }
            self.sequences[unit.txn] = next;
            used.insert(next);
        }

        address.writes = sorted;
        address.writes.extend(remaining);
    }

    /// Aborts every committed reader that is ordered by `(sequence, index)` after a committed
    /// writer of the same address, other than itself.
    pub fn validate(&mut self) {
        let mut stale = vec![];
        for address in self.addresses.values() {
            let writers: Vec<(u32, TxnIndex)> = address
                .writes
                .iter()
                .filter(|unit| !self.aborted[unit.txn])
                .map(|unit| (self.sequences[unit.txn], unit.txn))
                .collect();
            for reader in address.reads.iter().filter(|unit| !self.aborted[unit.txn]) {
                let position = (self.sequences[reader.txn], reader.txn);
                if writers
                    .iter()
                    .any(|writer| writer.1 != reader.txn && *writer < position)
                {
                    stale.push(reader.txn);
                }
            }
        }
        for txn in stale {
            self.aborted[txn] = true;
        }
    }

    pub fn sequence(&self, txn: TxnIndex) -> u32 {
        self.sequences[txn]
    }

    pub fn is_aborted(&self, txn: TxnIndex) -> bool {
        self.aborted[txn]
    }

    pub fn address(&self, key: &str) -> Option<&Address> {
        self.addresses.get(key)
    }

    /// Transactions that keep their simulated results, ordered by `(sequence, index)`.
    pub fn tx_list(&self) -> Vec<TxnIndex> {
        (0..self.aborted.len())
            .filter(|&txn| !self.aborted[txn])
            .sorted_by_key(|&txn| (self.sequences[txn], txn))
            .collect()
    }

    /// Transactions that must be re-executed, ascending.
    pub fn aborted_txs(&self) -> Vec<TxnIndex> {
        (0..self.aborted.len())
            .filter(|&txn| self.aborted[txn])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::{collection::vec, prelude::*};

    fn footprint(reads: &[&str], writes: &[&str]) -> RwSet {
        let mut rw = RwSet::default();
        for key in reads {
            rw.reads.insert(key.to_string(), String::new());
        }
        for key in writes {
            rw.writes.insert(key.to_string(), String::new());
        }
        rw
    }

    #[test]
    fn second_updater_of_an_address_is_aborted() {
        let first = footprint(&["a"], &["a"]);
        let second = footprint(&["a"], &["a"]);
        let other = footprint(&[], &["b"]);
        let mut graph = ConflictGraph::construct(&[&first, &second, &other]);
        graph.hierarchical_sort();
        graph.validate();

        assert!(graph.is_aborted(1));
        assert_eq!(graph.aborted_txs(), vec![1]);
        assert!(!graph.tx_list().contains(&1));
        assert_eq!(graph.address("a").map(|address| address.writes.len()), Some(1));
    }

    #[test]
    fn co_located_updater_is_sequenced_after_readers() {
        let reader = footprint(&["a"], &[]);
        let updater = footprint(&["a"], &["a"]);
        let mut graph = ConflictGraph::construct(&[&reader, &updater]);
        graph.hierarchical_sort();
        graph.validate();

        assert_eq!(graph.sequence(0), 1);
        assert_eq!(graph.sequence(1), 2);
        assert_eq!(graph.tx_list(), vec![0, 1]);
        assert!(graph.aborted_txs().is_empty());
    }

    #[test]
    fn reader_sequenced_after_a_writer_is_aborted() {
        // tx0 writes x and reads y, tx1 writes y and reads x: one of them reads stale state.
        let a = footprint(&["y"], &["x"]);
        let b = footprint(&["x"], &["y"]);
        let mut graph = ConflictGraph::construct(&[&a, &b]);
        graph.hierarchical_sort();
        graph.validate();
        assert_eq!(graph.aborted_txs().len(), 1);
        assert_eq!(graph.tx_list().len(), 1);
    }

    #[test]
    fn addresses_rank_by_degrees_then_key() {
        let t0 = footprint(&["r"], &["w"]);
        let t1 = footprint(&["r", "s"], &["v"]);
        let graph = ConflictGraph::construct(&[&t0, &t1]);
        // r: in 2, s: in 1, v and w: in 0 with out 2 and 1.
        assert_eq!(graph.address_rank(), vec!["r", "s", "w", "v"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn parallel_construction_matches_sequential(
            sets in vec((vec(0u8..6, 0..3), vec(0u8..6, 0..3)), 0..40),
            num_threads in 1usize..6,
        ) {
            let footprints: Vec<RwSet> = sets
                .iter()
                .map(|(reads, writes)| {
                    let mut rw = RwSet::default();
                    for k in reads {
                        rw.reads.insert(k.to_string(), String::new());
                    }
                    for k in writes {
                        rw.writes.insert(k.to_string(), String::new());
                    }
                    rw
                })
                .collect();
            let refs: Vec<&RwSet> = footprints.iter().collect();

            let mut sequential = ConflictGraph::construct(&refs);
            let mut parallel = ConflictGraph::parallel_construct(&refs, num_threads);
            prop_assert_eq!(&sequential.addresses, &parallel.addresses);

            sequential.hierarchical_sort();
            parallel.hierarchical_sort();
            sequential.validate();
            parallel.validate();
            prop_assert_eq!(sequential.tx_list(), parallel.tx_list());
            prop_assert_eq!(sequential.aborted_txs(), parallel.aborted_txs());

            // Committed readers never follow a committed writer of the same address.
            for (key, address) in &sequential.addresses {
                for reader in address.reads.iter().filter(|u| !sequential.is_aborted(u.txn)) {
                    for writer in address.writes.iter().filter(|u| !sequential.is_aborted(u.txn)) {
                        if writer.txn != reader.txn {
                            prop_assert!(
                                (sequential.sequence(reader.txn), reader.txn)
                                    < (sequential.sequence(writer.txn), writer.txn),
                                "reader {} after writer {} on {}", reader.txn, writer.txn, key
                            );
                        }
                    }
                }
            }
        }
    }
}
