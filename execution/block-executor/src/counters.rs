// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{
    HistogramVec, IntCounterVec, exponential_buckets, register_histogram_vec,
    register_int_counter_vec,
};
use std::time::Duration;

pub const EXECUTE_PHASE: &str = "execute";
pub const VERIFY_PHASE: &str = "verify";
pub const FALLBACK_PHASE: &str = "fallback";
pub const ROLLBACK_PHASE: &str = "rollback";
pub const COMMIT_PHASE: &str = "commit";
pub const REEXECUTE_PHASE: &str = "reexecute";

/// Count of committed transactions.
pub static TXN_COMMIT_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "dcc_txn_commit_count",
        "Count of committed transactions",
        &["protocol"]
    )
    .unwrap()
});

/// Count of transaction executions, re-executions included.
pub static TXN_EXECUTION_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "dcc_txn_execution_count",
        "Count of transaction executions, including re-executions",
        &["protocol"]
    )
    .unwrap()
});

/// Simulated cost units spent executing transactions.
pub static TXN_OVERHEAD_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "dcc_txn_overhead_count",
        "Simulated cost units spent executing transactions",
        &["protocol"]
    )
    .unwrap()
});

/// Simulated cost units wasted on executions that were rolled back or fell back.
pub static TXN_ROLLBACK_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "dcc_txn_rollback_count",
        "Simulated cost units of rolled back executions",
        &["protocol"]
    )
    .unwrap()
});

pub static BLOCK_COUNT: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "dcc_block_count",
        "Count of fully executed blocks",
        &["protocol"]
    )
    .unwrap()
});

/// Latency between the first execution of a transaction and its commit.
pub static TXN_COMMIT_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "dcc_txn_commit_latency_seconds",
        "Latency from first execution to commit",
        &["protocol"],
        exponential_buckets(/*start=*/ 1e-6, /*factor=*/ 2.0, /*count=*/ 30).unwrap(),
    )
    .unwrap()
});

/// Wall time of the coarse phases of a block.
pub static PHASE_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "dcc_phase_seconds",
        "Wall time spent per protocol phase",
        &["protocol", "phase"],
        exponential_buckets(/*start=*/ 1e-6, /*factor=*/ 2.0, /*count=*/ 30).unwrap(),
    )
    .unwrap()
});

pub fn observe_phase(protocol: &str, phase: &'static str, duration: Duration) {
    PHASE_SECONDS
        .with_label_values(&[protocol, phase])
        .observe(duration.as_secs_f64());
}
