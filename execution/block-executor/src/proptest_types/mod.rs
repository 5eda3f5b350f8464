// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Block generators, a sequential baseline and helpers shared by the protocol tests and benches.

use crate::{
    protocol::Protocol,
    txn::{
        Block, BufferedView, FnTransaction, Key, NestedTransaction, RwSet, RwTransaction,
        SubTransaction, Transaction, Value,
    },
};
use proptest::{collection::vec, prelude::*};
use std::{collections::BTreeMap, sync::Arc};

/// Keys a generated transaction reads and writes, as indices into a small key space.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxnSpec {
    pub reads: Vec<u8>,
    pub writes: Vec<u8>,
}

impl TxnSpec {
    pub fn writes(keys: &[u8]) -> Self {
        Self {
            reads: vec![],
            writes: keys.to_vec(),
        }
    }
}

/// One node of a generated nested transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NestedSpec {
    pub reads: Vec<u8>,
    pub writes: Vec<u8>,
    pub children: Vec<NestedSpec>,
}

pub fn key(index: u8) -> Key {
    format!("k{}", index)
}

fn keys(indices: &[u8]) -> Vec<Key> {
    indices.iter().copied().map(key).collect()
}

pub fn txn_strategy(
    num_keys: u8,
    max_reads: usize,
    max_writes: usize,
) -> impl Strategy<Value = TxnSpec> {
    (
        vec(0..num_keys, 0..=max_reads),
        vec(0..num_keys, 0..=max_writes),
    )
        .prop_map(|(reads, writes)| TxnSpec { reads, writes })
}

/// Up to `max_blocks` blocks of up to `max_block_len` transactions over `num_keys` keys.
pub fn blocks_strategy(
    num_keys: u8,
    max_reads: usize,
    max_writes: usize,
    max_block_len: usize,
    max_blocks: usize,
) -> impl Strategy<Value = Vec<Vec<TxnSpec>>> {
    vec(
        vec(txn_strategy(num_keys, max_reads, max_writes), 0..=max_block_len),
        1..=max_blocks,
    )
}

fn node_strategy(num_keys: u8) -> impl Strategy<Value = NestedSpec> {
    (vec(0..num_keys, 0..=2), vec(0..num_keys, 0..=2)).prop_map(|(reads, writes)| NestedSpec {
        reads,
        writes,
        children: vec![],
    })
}

/// Nested transactions of depth at most three.
pub fn nested_txn_strategy(num_keys: u8) -> impl Strategy<Value = NestedSpec> {
    (
        node_strategy(num_keys),
        vec(
            (node_strategy(num_keys), vec(node_strategy(num_keys), 0..=2)),
            0..=3,
        ),
    )
        .prop_map(|(mut root, children)| {
            root.children = children
                .into_iter()
                .map(|(mut child, grandchildren)| {
                    child.children = grandchildren;
                    child
                })
                .collect();
            root
        })
}

pub fn nested_blocks_strategy(
    num_keys: u8,
    max_block_len: usize,
    max_blocks: usize,
) -> impl Strategy<Value = Vec<Vec<NestedSpec>>> {
    vec(
        vec(nested_txn_strategy(num_keys), 0..=max_block_len),
        1..=max_blocks,
    )
}

/// Every transaction reads its read keys, then writes its own tag to its write keys. Written
/// values never depend on what was read, so the outcome is decided by which writer of each key
/// comes last in the serialization order.
pub fn blind_write_blocks(specs: &[Vec<TxnSpec>]) -> Vec<Block> {
    specs
        .iter()
        .enumerate()
        .map(|(block, txns)| {
            let txns = txns
                .iter()
                .enumerate()
                .map(|(idx, spec)| {
                    Arc::new(RwTransaction::new(
                        keys(&spec.reads),
                        keys(&spec.writes),
                        format!("b{}-t{}", block, idx),
                    )) as Arc<dyn Transaction>
                })
                .collect();
            Block::new(block as u64, txns)
        })
        .collect()
}

/// Every transaction reads its read keys and writes a hash of its tag and the values it read, so
/// any serialization other than the preset one shows up in the final state.
pub fn computed_blocks(specs: &[Vec<TxnSpec>]) -> Vec<Block> {
    specs
        .iter()
        .enumerate()
        .map(|(block, txns)| {
            let txns = txns
                .iter()
                .enumerate()
                .map(|(idx, spec)| {
                    let tag = format!("b{}-t{}", block, idx);
                    let reads = keys(&spec.reads);
                    let writes = keys(&spec.writes);
                    let cost = (reads.len() + writes.len()) as u64;
                    Arc::new(
                        FnTransaction::new(move |view| {
                            let mut input = tag.clone();
                            for key in &reads {
                                input.push('|');
                                input.push_str(&view.get(key));
                            }
                            let value = format!("{:016x}", fxhash::hash64(&input));
                            for key in &writes {
                                view.put(key, value.clone());
                            }
                        })
                        .with_cost(cost),
                    ) as Arc<dyn Transaction>
                })
                .collect();
            Block::new(block as u64, txns)
        })
        .collect()
}

fn sub_transaction(spec: &NestedSpec, tag: &str, counter: &mut usize) -> SubTransaction {
    let children = spec
        .children
        .iter()
        .map(|child| sub_transaction(child, tag, counter))
        .collect();
    *counter += 1;
    SubTransaction::leaf(
        keys(&spec.reads),
        keys(&spec.writes),
        format!("{}-n{}", tag, counter),
    )
    .with_cost(1)
    .with_children(children)
}

/// Every node writes a value unique across the blocks.
pub fn nested_blocks(specs: &[Vec<NestedSpec>]) -> Vec<Block> {
    specs
        .iter()
        .enumerate()
        .map(|(block, txns)| {
            let txns = txns
                .iter()
                .enumerate()
                .map(|(idx, spec)| {
                    let mut counter = 0;
                    let root = sub_transaction(spec, &format!("b{}-t{}", block, idx), &mut counter);
                    Arc::new(NestedTransaction::new(root)) as Arc<dyn Transaction>
                })
                .collect();
            Block::new(block as u64, txns)
        })
        .collect()
}

/// `num_blocks` blocks in which transaction `i` increments key `d{i}`, so no two transactions of
/// a block share a key.
pub fn disjoint_blocks(num_blocks: usize, block_len: usize) -> Vec<Block> {
    (0..num_blocks)
        .map(|block| {
            let txns = (0..block_len)
                .map(|idx| {
                    let key = format!("d{}", idx);
                    Arc::new(FnTransaction::new(move |view| {
                        let next = view.get(&key).parse::<u64>().unwrap_or(0) + 1;
                        view.put(&key, next.to_string());
                    })) as Arc<dyn Transaction>
                })
                .collect();
            Block::new(block as u64, txns)
        })
        .collect()
}

/// Starts `protocol`, waits for it to run out of blocks and returns its committed state.
pub fn run_to_completion<P: Protocol + ?Sized>(protocol: &mut P) -> BTreeMap<Key, Value> {
    protocol.start().expect("protocol must start");
    protocol.wait().expect("protocol must finish");
    protocol.snapshot()
}

/// Executes the blocks one transaction at a time in their preset order.
pub fn serial_outcome(blocks: &[Block]) -> BTreeMap<Key, Value> {
    let mut state: BTreeMap<Key, Value> = BTreeMap::new();
    for block in blocks {
        for txn in block.txns() {
            let mut rw = RwSet::default();
            txn.execute(&mut BufferedView::new(&mut rw, |key: &str| {
                state.get(key).cloned().unwrap_or_default()
            }));
            state.extend(rw.writes);
        }
    }
    state.retain(|_, value| !value.is_empty());
    state
}
