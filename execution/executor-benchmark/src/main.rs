// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use dcc_executor_benchmark::{
    config::{BenchConfig, BenchPlan, ProtocolSpec, WorkloadSpec, parse_duration},
    gather_metrics, run_benchmark,
};
use std::{path::PathBuf, time::Duration};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Runs one concurrency-control protocol against a generated TPC-C style workload.
#[derive(Debug, Parser)]
#[clap(name = "dcc-bench")]
struct Args {
    /// Protocol specification, e.g. `Aria:8:1024:FALSE`.
    #[clap(required_unless_present = "config")]
    protocol: Option<ProtocolSpec>,

    /// Workload specification, `TPCC:WAREHOUSES:BLOCK_SIZE:NUM_BLOCKS:NESTED`.
    #[clap(required_unless_present = "config")]
    workload: Option<WorkloadSpec>,

    /// How long to run before stopping, e.g. `500ms`, `10s`, `2m`.
    #[clap(required_unless_present = "config", value_parser = parse_duration)]
    duration: Option<Duration>,

    /// YAML file holding `protocol`, `workload`, `duration` and optionally `seed`.
    #[clap(long, conflicts_with_all = ["protocol", "workload", "duration"])]
    config: Option<PathBuf>,

    /// Workload seed. Overrides the seed of the config file.
    #[clap(long)]
    seed: Option<u64>,

    #[clap(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Print every prometheus metric after the report.
    #[clap(long)]
    print_metrics: bool,
}

impl Args {
    fn plan(&self) -> Result<BenchPlan> {
        let mut plan = match &self.config {
            Some(path) => BenchConfig::load(path)?
                .resolve()
                .with_context(|| format!("invalid config {}", path.display()))?,
            None => match (self.protocol, self.workload, self.duration) {
                (Some(protocol), Some(workload), Some(duration)) => BenchPlan {
                    protocol,
                    workload,
                    duration,
                    seed: 0,
                },
                _ => bail!("protocol, workload and duration are required without --config"),
            },
        };
        if let Some(seed) = self.seed {
            plan.seed = seed;
        }
        Ok(plan)
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let plan = args.plan()?;
    let report = run_benchmark(&plan)?;
    println!("{}", report);
    if args.print_metrics {
        println!("{}", gather_metrics());
    }
    Ok(())
}

#[test]
fn verify_tool() {
    use clap::CommandFactory;
    Args::command().debug_assert()
}

#[test]
fn positional_arguments_build_a_plan() {
    let args = Args::parse_from(["dcc-bench", "Moss:2:8", "TPCC:1:10:2:TRUE", "50ms", "--seed", "3"]);
    let plan = args.plan().unwrap();
    assert_eq!(plan.protocol.name(), "Moss");
    assert!(plan.workload.nested);
    assert_eq!(plan.duration, Duration::from_millis(50));
    assert_eq!(plan.seed, 3);
}

#[test]
fn config_conflicts_with_positional_arguments() {
    assert!(
        Args::try_parse_from(["dcc-bench", "Serial:1", "--config", "bench.yaml"]).is_err()
    );
    assert!(Args::try_parse_from(["dcc-bench"]).is_err());
}
