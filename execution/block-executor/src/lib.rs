// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Deterministic concurrency-control protocols for executing ordered blocks of transactions
//! against a shared, partitioned key-value table.
//!
//! Every protocol takes a list of `Block`s at construction and implements `Protocol`: it is
//! started once, runs its own worker threads, and can be stopped or waited on. Once it is done,
//! `Protocol::snapshot` returns the committed state, which for every deterministic protocol
//! equals the outcome of executing the blocks one transaction at a time in their preset order.
//!
//! | Protocol  | Approach                                                              |
//! |-----------|-----------------------------------------------------------------------|
//! | `Serial`  | single thread, one transaction at a time                             |
//! | `Aria`    | batch execute, reserve, verify, pessimistic fallback                  |
//! | `AriaEr`  | `Aria` plus early-abort rounds                                        |
//! | `Harmony` | per-key reservations ordered by transaction index, inter-block reads  |
//! | `Fractal` | direct execution, per-key access tracking, no reconciliation          |
//! | `Moss`    | nested transactions with partial rollback of sub-transactions         |
//! | `Loom`    | pre-execution with reservations, minimal rollback, deterministic redo |
//! | `OptMe`   | simulate, reorder with an address conflict graph, redo in epochs      |

pub mod affinity;
pub mod arena;
pub mod counters;
pub mod errors;
pub mod fractal;
pub mod loom;
pub mod moss;
pub mod optme;
pub mod phased;
pub mod protocol;
#[cfg(any(test, feature = "fuzzing"))]
pub mod proptest_types;
pub mod schedule;
pub mod serial;
pub mod statistics;
pub mod sync;
pub mod thread_pool;
pub mod txn;

pub use errors::{ExecutorError, ExecutorResult};
pub use fractal::Fractal;
pub use loom::Loom;
pub use moss::Moss;
pub use optme::OptMe;
pub use phased::{Aria, AriaEr, Harmony};
pub use protocol::{Partitioning, Protocol};
pub use serial::Serial;
pub use statistics::{Statistics, StatisticsReport};
pub use txn::{
    Block, FnTransaction, Key, NestedTransaction, RwSet, RwTransaction, StorageView,
    SubTransaction, Transaction, TxnIndex, Value,
};
