// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Synthetic TPC-C style workload for the concurrency-control protocols.
//!
//! The generator is seeded, so the same configuration and seed always produce the same blocks.
//! Transactions are expressed over string keys of the form `w{w}`, `w{w}-d{d}`, `w{w}-s{item}`,
//! etc. and every transaction touches a fixed set of keys that only depends on its parameters.

mod random;
mod tpcc;

pub use tpcc::{
    N_CARRIERS, N_CUSTOMERS, N_DISTRICTS, N_ITEMS, OrderLine, TpccConfig, TpccTxn, TpccWorkload,
    TxnKind,
};
