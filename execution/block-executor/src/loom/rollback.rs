// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::txn::{RwSet, TxnIndex};
use hashbrown::HashMap;
use petgraph::{
    Direction,
    algo::tarjan_scc,
    stable_graph::{NodeIndex, StableDiGraph},
};
use std::{cmp::Reverse, collections::BinaryHeap};

/// Outcome of breaking the read-before-write cycles of a block.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RollbackPlan {
    /// Transactions that keep their pre-executed results, in serialization order.
    pub serial_order: Vec<TxnIndex>,
    /// Transactions that must be re-executed, ascending.
    pub rolled_back: Vec<TxnIndex>,
}

/// Every transaction that read a key must be serialized before every other transaction of the
/// block that wrote it, since it observed the value from before the block. The resulting graph
/// has an edge reader -> writer per such pair.
fn dependency_graph(footprints: &[&RwSet]) -> StableDiGraph<TxnIndex, ()> {
    let mut graph = StableDiGraph::with_capacity(footprints.len(), 0);
    let nodes: Vec<NodeIndex> = (0..footprints.len()).map(|idx| graph.add_node(idx)).collect();

    let mut writers: HashMap<&str, Vec<TxnIndex>> = HashMap::new();
    for (idx, rw) in footprints.iter().enumerate() {
        for key in rw.write_keys() {
            writers.entry(key.as_str()).or_default().push(idx);
        }
    }
    for (reader, rw) in footprints.iter().enumerate() {
        for key in rw.read_keys() {
            for &writer in writers.get(key.as_str()).into_iter().flatten() {
                if writer != reader {
                    graph.update_edge(nodes[reader], nodes[writer], ());
                }
            }
        }
    }
    graph
}

/// Greedily removes, from every strongly connected component with more than one member, the
/// transaction with the smallest `(cost, index)` until the graph is acyclic. The survivors are
/// ordered topologically, smallest index first among the ready ones.
pub fn min_w_rollback(footprints: &[&RwSet], costs: &[u64]) -> RollbackPlan {
    let mut graph = dependency_graph(footprints);
    let mut rolled_back = vec![];

    loop {
        let victims: Vec<NodeIndex> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .filter_map(|scc| {
                scc.into_iter()
                    .min_by_key(|&node| (costs[graph[node]], graph[node]))
            })
            .collect();
        if victims.is_empty() {
            break;
        }
        for node in victims {
            if let Some(idx) = graph.remove_node(node) {
                rolled_back.push(idx);
            }
        }
    }
    rolled_back.sort_unstable();

    RollbackPlan {
        serial_order: topological_order(&graph),
        rolled_back,
    }
}

fn topological_order(graph: &StableDiGraph<TxnIndex, ()>) -> Vec<TxnIndex> {
    let mut in_degree: HashMap<NodeIndex, usize> = graph
        .node_indices()
        .map(|node| (node, graph.neighbors_directed(node, Direction::Incoming).count()))
        .collect();
    let mut ready: BinaryHeap<Reverse<(TxnIndex, NodeIndex)>> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(&node, _)| Reverse((graph[node], node)))
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse((idx, node))) = ready.pop() {
        order.push(idx);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            if let Some(degree) = in_degree.get_mut(&next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((graph[next], next)));
                }
            }
        }
    }
    order
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
    fn two_cycle_rolls_back_the_cheaper_transaction() {
        let a = footprint(&["x"], &["y"]);
        let b = footprint(&["y"], &["x"]);
        assert_eq!(min_w_rollback(&[&a, &b], &[5, 1]), RollbackPlan {
            serial_order: vec![0],
            rolled_back: vec![1],
        });
        assert_eq!(min_w_rollback(&[&a, &b], &[1, 5]), RollbackPlan {
            serial_order: vec![1],
            rolled_back: vec![0],
        });
        // Equal costs: the smaller index goes.
        assert_eq!(min_w_rollback(&[&a, &b], &[2, 2]).rolled_back, vec![0]);
    }

    #[test]
    fn readers_are_ordered_before_writers() {
        // tx0 writes x, tx1 reads x: tx1 must come first.
        let w = footprint(&[], &["x"]);
        let r = footprint(&["x"], &["z"]);
        let blind = footprint(&[], &["q"]);
        let plan = min_w_rollback(&[&w, &r, &blind], &[0, 0, 0]);
        assert!(plan.rolled_back.is_empty());
        assert_eq!(plan.serial_order, vec![1, 0, 2]);
    }

    #[test]
    fn blind_writes_keep_index_order() {
        let sets: Vec<RwSet> = (0..5).map(|_| footprint(&[], &["k"])).collect();
        let refs: Vec<&RwSet> = sets.iter().collect();
        let plan = min_w_rollback(&refs, &[0; 5]);
        assert_eq!(plan.serial_order, vec![0, 1, 2, 3, 4]);
        assert!(plan.rolled_back.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn survivors_are_a_valid_serialization(
            sets in vec((vec(0u8..5, 0..3), vec(0u8..5, 0..3), 0u64..4), 1..20),
        ) {
            let footprints: Vec<RwSet> = sets
                .iter()
                .map(|(reads, writes, _)| {
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
            let costs: Vec<u64> = sets.iter().map(|(_, _, cost)| *cost).collect();
            let plan = min_w_rollback(&refs, &costs);

            let mut all: Vec<TxnIndex> = plan
                .serial_order
                .iter()
                .chain(plan.rolled_back.iter())
                .copied()
                .collect();
            all.sort_unstable();
            prop_assert_eq!(all, (0..footprints.len()).collect::<Vec<_>>());

            let position: HashMap<TxnIndex, usize> = plan
                .serial_order
                .iter()
                .enumerate()
                .map(|(pos, &idx)| (idx, pos))
                .collect();
            for (&reader, &r_pos) in &position {
                for (&writer, &w_pos) in &position {
                    let read_then_written = footprints[reader]
                        .read_keys()
                        .any(|k| footprints[writer].writes.contains_key(k));
                    if reader != writer && read_then_written {
                        prop_assert!(r_pos < w_pos);
                    }
                }
            }
        }
    }
}
