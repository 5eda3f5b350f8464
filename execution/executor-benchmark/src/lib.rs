// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

pub mod config;

use crate::config::BenchPlan;
use dcc_block_executor::{ExecutorResult, Statistics, StatisticsReport};
use dcc_workload_generator::TpccWorkload;
use prometheus::{Encoder, TextEncoder};
use std::{sync::Arc, thread, time::Instant};
use tracing::{info, warn};

/// Generates the workload, runs the protocol for the planned duration and returns its report.
pub fn run_benchmark(plan: &BenchPlan) -> ExecutorResult<StatisticsReport> {
    let cores = num_cpus::get();
    if plan.protocol.threads() > cores {
        warn!(
            threads = plan.protocol.threads(),
            cores, "more protocol workers than available cores"
        );
    }

    let generation_started = Instant::now();
    let blocks = TpccWorkload::new(plan.workload.into(), plan.seed).blocks();
    info!(
        blocks = blocks.len(),
        elapsed_ms = generation_started.elapsed().as_millis() as u64,
        "workload generated"
    );

    let statistics = Arc::new(Statistics::new(plan.protocol.name()));
    let mut protocol = plan.protocol.build(blocks, statistics.clone());
    info!(protocol = %plan.protocol, duration = ?plan.duration, "starting benchmark");
    protocol.start()?;
    thread::sleep(plan.duration);
    protocol.stop()?;

    let report = statistics.report();
    info!(
        protocol = protocol.name(),
        commits = report.commit,
        blocks = report.block,
        "benchmark finished"
    );
    Ok(report)
}

/// Every registered metric in the prometheus text format.
pub fn gather_metrics() -> String {
    let mut buffer = vec![];
    if let Err(err) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %err, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProtocolSpec, WorkloadSpec};
    use claims::assert_ok;
    use std::time::Duration;
    use test_case::test_case;

    fn plan(protocol: &str) -> BenchPlan {
        BenchPlan {
            protocol: assert_ok!(protocol.parse::<ProtocolSpec>()),
            workload: WorkloadSpec {
                warehouses: 1,
                block_size: 20,
                num_blocks: 2,
                nested: protocol.starts_with("Moss") || protocol.starts_with("Loom"),
            },
            duration: Duration::from_secs(1),
            seed: 1,
        }
    }

    #[test_case("Serial:4")]
    #[test_case("Aria:2:16:FALSE")]
    #[test_case("AriaER:2:16:TRUE")]
    #[test_case("Harmony:2:16:TRUE")]
    #[test_case("Moss:2:16")]
    #[test_case("Loom:2:16:TRUE:TRUE")]
    #[test_case("OptME:2:16")]
    fn small_workloads_run_to_completion(protocol: &str) {
        let report = assert_ok!(run_benchmark(&plan(protocol)));
        assert_eq!(report.block, 2);
        assert_eq!(report.commit, 40);
    }

    #[test]
    fn metrics_include_commit_counter() {
        assert_ok!(run_benchmark(&plan("Serial:2")));
        assert!(gather_metrics().contains("dcc_txn_commit_count"));
    }
}
