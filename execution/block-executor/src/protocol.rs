// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    affinity::pin_round_robin,
    errors::{ExecutorError, ExecutorResult},
    txn::{Key, Value},
};
use dcc_partitioned_table::Table;
use std::{
    any::Any,
    collections::BTreeMap,
    thread::{self, JoinHandle},
};
use tracing::{error, info};

/// Common lifecycle of every concurrency-control protocol.
///
/// A protocol is constructed with its blocks, started once, and then either stopped (stop is
/// cooperative and observed at phase or block boundaries) or waited on until it has executed
/// every block.
pub trait Protocol: Send {
    fn name(&self) -> &'static str;

    /// Spawns the protocol's workers. Fails if the protocol was already started.
    fn start(&mut self) -> ExecutorResult<()>;

    /// Requests every worker to exit and joins them.
    fn stop(&mut self) -> ExecutorResult<()>;

    /// Joins the workers after they ran out of blocks.
    fn wait(&mut self) -> ExecutorResult<()>;

    /// Committed state, empty values excluded.
    fn snapshot(&self) -> BTreeMap<Key, Value>;
}

/// Tracks the threads a protocol spawned.
#[derive(Default)]
pub(crate) enum Lifecycle {
    #[default]
    Idle,
    Running(Vec<JoinHandle<()>>),
    Joined,
}

impl Lifecycle {
    pub(crate) fn ensure_idle(&self, protocol: &'static str) -> ExecutorResult<()> {
        match self {
            Lifecycle::Idle => Ok(()),
            _ => Err(ExecutorError::AlreadyStarted(protocol)),
        }
    }

    pub(crate) fn ensure_started(&self, protocol: &'static str) -> ExecutorResult<()> {
        match self {
            Lifecycle::Idle => Err(ExecutorError::NotStarted(protocol)),
            _ => Ok(()),
        }
    }

    pub(crate) fn running(&mut self, handles: Vec<JoinHandle<()>>, protocol: &'static str) {
        info!(protocol, workers = handles.len(), "protocol started");
        *self = Lifecycle::Running(handles);
    }

    /// Joins every spawned thread. Joining twice is a no-op.
    pub(crate) fn join(&mut self, protocol: &'static str) -> ExecutorResult<()> {
        self.ensure_started(protocol)?;
        let handles = match std::mem::replace(self, Lifecycle::Joined) {
            Lifecycle::Running(handles) => handles,
            _ => return Ok(()),
        };
        let mut result = Ok(());
        for handle in handles {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if let Err(payload) = handle.join() {
                error!(protocol, thread = %name, panic = %panic_message(&payload), "worker panicked");
                if result.is_ok() {
                    result = Err(ExecutorError::WorkerPanicked(name));
                }
            }
        }
        info!(protocol, "protocol joined");
        result
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Spawns a named OS thread, optionally pinned to core `pin_index` (round robin).
pub(crate) fn spawn_named(
    name: String,
    pin_index: Option<usize>,
    body: impl FnOnce() + Send + 'static,
) -> ExecutorResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            if let Some(index) = pin_index {
                pin_round_robin(index);
            }
            body()
        })
        .map_err(|source| ExecutorError::ThreadSpawn { name, source })
}

/// Collects `(key, value(entry))` for every entry whose value is non-empty.
pub(crate) fn collect_values<V: Default>(
    table: &Table<Key, V>,
    value: impl Fn(&V) -> &Value,
) -> BTreeMap<Key, Value> {
    let mut snapshot = BTreeMap::new();
    table.for_each(|key, entry| {
        let value = value(entry);
        if !value.is_empty() {
            snapshot.insert(key.clone(), value.clone());
        }
    });
    snapshot
}

/// Splits `0..num_txns` into per-worker index lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Partitioning {
    /// Worker `w` gets the `w`-th chunk of `ceil(n / workers)` consecutive transactions.
    Contiguous,
    /// Transaction `i` goes to worker `i % workers`.
    RoundRobin,
}

impl Partitioning {
    pub fn assign(self, num_txns: usize, num_workers: usize) -> Vec<Vec<usize>> {
        let num_workers = num_workers.max(1);
        let mut assignment = vec![vec![]; num_workers];
        match self {
            Partitioning::Contiguous => {
                let chunk = num_txns.div_ceil(num_workers).max(1);
                for idx in 0..num_txns {
                    assignment[idx / chunk].push(idx);
                }
            },
            Partitioning::RoundRobin => {
                for idx in 0..num_txns {
                    assignment[idx % num_workers].push(idx);
                }
            },
        }
        assignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use test_case::test_case;

    #[test_case(Partitioning::Contiguous, 10, 3, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]; "contiguous uneven")]
    #[test_case(Partitioning::Contiguous, 2, 4, vec![vec![0], vec![1], vec![], vec![]]; "contiguous more workers than txns")]
    #[test_case(Partitioning::RoundRobin, 7, 3, vec![vec![0, 3, 6], vec![1, 4], vec![2, 5]]; "round robin")]
    #[test_case(Partitioning::RoundRobin, 0, 2, vec![vec![], vec![]]; "round robin empty")]
    fn partitioning_assigns_every_txn_once(
        partitioning: Partitioning,
        num_txns: usize,
        num_workers: usize,
        expected: Vec<Vec<usize>>,
    ) {
        assert_eq!(partitioning.assign(num_txns, num_workers), expected);
    }

    #[test]
    fn lifecycle_rejects_misuse() {
        let mut lifecycle = Lifecycle::default();
        assert_ok!(lifecycle.ensure_idle("unit"));
        assert_err!(lifecycle.join("unit"));

        let handle = assert_ok!(spawn_named("unit-worker".into(), None, || ()));
        lifecycle.running(vec![handle], "unit");
        assert_err!(lifecycle.ensure_idle("unit"));
        assert_ok!(lifecycle.join("unit"));
        assert_ok!(lifecycle.join("unit"));
    }

    #[test]
    fn panicking_worker_is_reported() {
        let mut lifecycle = Lifecycle::default();
        let handle = assert_ok!(spawn_named("unit-panicker".into(), None, || panic!("boom")));
        lifecycle.running(vec![handle], "unit");
        assert!(matches!(
            lifecycle.join("unit"),
            Err(ExecutorError::WorkerPanicked(name)) if name == "unit-panicker"
        ));
    }
}
