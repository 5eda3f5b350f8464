// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Protocol and workload specification strings, durations and the YAML benchmark file.
//!
//! Specification strings are colon separated, e.g. `Aria:8:1024:FALSE` or `TPCC:4:1000:20:TRUE`.

use dcc_block_executor::{
    Aria, AriaEr, Block, Fractal, Harmony, Loom, Moss, OptMe, Protocol, Serial, Statistics,
};
use dcc_workload_generator::TpccConfig;
use serde::Deserialize;
use std::{fmt, fs, path::Path, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown protocol option ({0})")]
    UnknownProtocol(String),

    #[error("protocol {name} has {expected} args -- ({signature}), but we found {found} args")]
    ArgumentCount {
        name: String,
        expected: usize,
        signature: &'static str,
        found: usize,
    },

    #[error("cannot recognize ({0}) as boolean should be either TRUE or FALSE")]
    InvalidBool(String),

    #[error("cannot recognize ({0}) as a non-negative integer")]
    InvalidInteger(String),

    #[error("unknown workload option ({0})")]
    UnknownWorkload(String),

    #[error("cannot recognize ({0}) as a duration, expected <n>ms, <n>s, <n>m or <n>h")]
    InvalidDuration(String),

    #[error("protocol {0} needs at least one thread")]
    ZeroThreads(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse benchmark config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn parse_bool(s: &str) -> Result<bool, ConfigError> {
    match s {
        "TRUE" => Ok(true),
        "FALSE" => Ok(false),
        _ => Err(ConfigError::InvalidBool(s.to_string())),
    }
}

fn parse_int<T: FromStr>(s: &str) -> Result<T, ConfigError> {
    s.parse().map_err(|_| ConfigError::InvalidInteger(s.to_string()))
}

/// Splits `NAME:ARG:...` and checks the argument count against `signature`.
fn arguments<'a>(
    name: &str,
    signature: &'static str,
    args: &[&'a str],
) -> Result<Vec<&'a str>, ConfigError> {
    let expected = signature.split(", ").count();
    if args.len() != expected {
        return Err(ConfigError::ArgumentCount {
            name: name.to_string(),
            expected,
            signature,
            found: args.len(),
        });
    }
    Ok(args.to_vec())
}

fn threads(name: &str, s: &str) -> Result<usize, ConfigError> {
    match parse_int(s)? {
        0 => Err(ConfigError::ZeroThreads(name.to_string())),
        threads => Ok(threads),
    }
}

/// A protocol together with its construction parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolSpec {
    Serial {
        partitions: usize,
    },
    Aria {
        threads: usize,
        partitions: usize,
        reordering: bool,
    },
    AriaEr {
        threads: usize,
        partitions: usize,
        reordering: bool,
    },
    Harmony {
        threads: usize,
        partitions: usize,
        inter_block: bool,
    },
    Fractal {
        threads: usize,
        partitions: usize,
    },
    Moss {
        threads: usize,
        partitions: usize,
    },
    Loom {
        threads: usize,
        partitions: usize,
        inter_block: bool,
        nested_reexecution: bool,
    },
    OptMe {
        threads: usize,
        partitions: usize,
    },
}

impl ProtocolSpec {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolSpec::Serial { .. } => "Serial",
            ProtocolSpec::Aria { .. } => "Aria",
            ProtocolSpec::AriaEr { .. } => "AriaER",
            ProtocolSpec::Harmony { .. } => "Harmony",
            ProtocolSpec::Fractal { .. } => "Fractal",
            ProtocolSpec::Moss { .. } => "Moss",
            ProtocolSpec::Loom { .. } => "Loom",
            ProtocolSpec::OptMe { .. } => "OptME",
        }
    }

    /// Worker threads the protocol runs, its driver thread excluded.
    pub fn threads(&self) -> usize {
        match *self {
            ProtocolSpec::Serial { .. } => 1,
            ProtocolSpec::Aria { threads, .. }
            | ProtocolSpec::AriaEr { threads, .. }
            | ProtocolSpec::Harmony { threads, .. }
            | ProtocolSpec::Fractal { threads, .. }
            | ProtocolSpec::Moss { threads, .. }
            | ProtocolSpec::Loom { threads, .. }
            | ProtocolSpec::OptMe { threads, .. } => threads,
        }
    }

    pub fn build(&self, blocks: Vec<Block>, statistics: Arc<Statistics>) -> Box<dyn Protocol> {
        match *self {
            ProtocolSpec::Serial { partitions } => {
                Box::new(Serial::new(blocks, statistics, partitions))
            },
            ProtocolSpec::Aria {
                threads,
                partitions,
                reordering,
            } => Box::new(Aria::new(blocks, statistics, threads, partitions, reordering)),
            ProtocolSpec::AriaEr {
                threads,
                partitions,
                reordering,
            } => Box::new(AriaEr::new(blocks, statistics, threads, partitions, reordering)),
            ProtocolSpec::Harmony {
                threads,
                partitions,
                inter_block,
            } => Box::new(Harmony::new(blocks, statistics, threads, partitions, inter_block)),
            ProtocolSpec::Fractal {
                threads,
                partitions,
            } => Box::new(Fractal::new(blocks, statistics, threads, partitions)),
            ProtocolSpec::Moss {
                threads,
                partitions,
            } => Box::new(Moss::new(blocks, statistics, threads, partitions)),
            ProtocolSpec::Loom {
                threads,
                partitions,
                inter_block,
                nested_reexecution,
            } => Box::new(Loom::new(
                blocks,
                statistics,
                threads,
                partitions,
                inter_block,
                nested_reexecution,
            )),
            ProtocolSpec::OptMe {
                threads,
                partitions,
            } => Box::new(OptMe::new(blocks, statistics, threads, partitions)),
        }
    }
}

impl FromStr for ProtocolSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let name = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();
        let spec = match name {
            "Serial" => {
                let args = arguments(name, "PARTITIONS", &rest)?;
                ProtocolSpec::Serial {
                    partitions: parse_int(args[0])?,
                }
            },
            "Aria" | "AriaER" => {
                let args = arguments(name, "THREADS, PARTITIONS, REORDERING", &rest)?;
                let threads = threads(name, args[0])?;
                let partitions = parse_int(args[1])?;
                let reordering = parse_bool(args[2])?;
                if name == "Aria" {
                    ProtocolSpec::Aria {
                        threads,
                        partitions,
                        reordering,
                    }
                } else {
                    ProtocolSpec::AriaEr {
                        threads,
                        partitions,
                        reordering,
                    }
                }
            },
            "Harmony" => {
                let args = arguments(name, "THREADS, PARTITIONS, INTER_BLOCK", &rest)?;
                ProtocolSpec::Harmony {
                    threads: threads(name, args[0])?,
                    partitions: parse_int(args[1])?,
                    inter_block: parse_bool(args[2])?,
                }
            },
            "Fractal" | "Moss" | "OptME" => {
                let args = arguments(name, "THREADS, PARTITIONS", &rest)?;
                let threads = threads(name, args[0])?;
                let partitions = parse_int(args[1])?;
                match name {
                    "Fractal" => ProtocolSpec::Fractal {
                        threads,
                        partitions,
                    },
                    "Moss" => ProtocolSpec::Moss {
                        threads,
                        partitions,
                    },
                    _ => ProtocolSpec::OptMe {
                        threads,
                        partitions,
                    },
                }
            },
            "Loom" => {
                let args = arguments(
                    name,
                    "THREADS, PARTITIONS, INTER_BLOCK, NESTED_REEXECUTION",
                    &rest,
                )?;
                ProtocolSpec::Loom {
                    threads: threads(name, args[0])?,
                    partitions: parse_int(args[1])?,
                    inter_block: parse_bool(args[2])?,
                    nested_reexecution: parse_bool(args[3])?,
                }
            },
            _ => return Err(ConfigError::UnknownProtocol(name.to_string())),
        };
        Ok(spec)
    }
}

fn flag(value: bool) -> &'static str {
    if value { "TRUE" } else { "FALSE" }
}

impl fmt::Display for ProtocolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        match *self {
            ProtocolSpec::Serial { partitions } => write!(f, "{}:{}", name, partitions),
            ProtocolSpec::Aria {
                threads,
                partitions,
                reordering,
            }
            | ProtocolSpec::AriaEr {
                threads,
                partitions,
                reordering,
            } => write!(f, "{}:{}:{}:{}", name, threads, partitions, flag(reordering)),
            ProtocolSpec::Harmony {
                threads,
                partitions,
                inter_block,
            } => write!(f, "{}:{}:{}:{}", name, threads, partitions, flag(inter_block)),
            ProtocolSpec::Fractal {
                threads,
                partitions,
            }
            | ProtocolSpec::Moss {
                threads,
                partitions,
            }
            | ProtocolSpec::OptMe {
                threads,
                partitions,
            } => write!(f, "{}:{}:{}", name, threads, partitions),
            ProtocolSpec::Loom {
                threads,
                partitions,
                inter_block,
                nested_reexecution,
            } => write!(
                f,
                "{}:{}:{}:{}:{}",
                name,
                threads,
                partitions,
                flag(inter_block),
                flag(nested_reexecution)
            ),
        }
    }
}

/// `TPCC:WAREHOUSES:BLOCK_SIZE:NUM_BLOCKS:NESTED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub warehouses: u64,
    pub block_size: usize,
    pub num_blocks: usize,
    pub nested: bool,
}

impl FromStr for WorkloadSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let name = parts.next().unwrap_or_default();
        if name != "TPCC" {
            return Err(ConfigError::UnknownWorkload(name.to_string()));
        }
        let rest: Vec<&str> = parts.collect();
        let args = arguments(name, "WAREHOUSES, BLOCK_SIZE, NUM_BLOCKS, NESTED", &rest)?;
        Ok(WorkloadSpec {
            warehouses: parse_int(args[0])?,
            block_size: parse_int(args[1])?,
            num_blocks: parse_int(args[2])?,
            nested: parse_bool(args[3])?,
        })
    }
}

impl From<WorkloadSpec> for TpccConfig {
    fn from(spec: WorkloadSpec) -> Self {
        TpccConfig {
            warehouses: spec.warehouses,
            block_size: spec.block_size,
            num_blocks: spec.num_blocks,
            nested: spec.nested,
        }
    }
}

/// Parses `<n><unit>` with unit `ms`, `s`, `m` or `h`.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(s.to_string());
    let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
    let (amount, unit) = s.split_at(split);
    let amount: u64 = amount.parse().map_err(|_| invalid())?;
    let duration = match unit {
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount * 60),
        "h" => Duration::from_secs(amount * 3600),
        _ => return Err(invalid()),
    };
    Ok(duration)
}

/// On-disk form of a benchmark run. Every field is a specification string.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BenchConfig {
    pub protocol: String,
    pub workload: String,
    pub duration: String,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl BenchConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn resolve(&self) -> Result<BenchPlan, ConfigError> {
        Ok(BenchPlan {
            protocol: self.protocol.parse()?,
            workload: self.workload.parse()?,
            duration: parse_duration(&self.duration)?,
            seed: self.seed.unwrap_or_default(),
        })
    }
}

/// A fully parsed benchmark run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BenchPlan {
    pub protocol: ProtocolSpec,
    pub workload: WorkloadSpec,
    pub duration: Duration,
    pub seed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok, assert_ok_eq};
    use test_case::test_case;

    #[test_case("Serial:16"; "serial")]
    #[test_case("Aria:8:1024:FALSE"; "aria")]
    #[test_case("AriaER:4:64:TRUE"; "aria er")]
    #[test_case("Harmony:2:128:TRUE"; "harmony")]
    #[test_case("Fractal:3:32"; "fractal")]
    #[test_case("Moss:6:256"; "moss")]
    #[test_case("Loom:8:512:TRUE:FALSE"; "loom")]
    #[test_case("OptME:4:64"; "optme")]
    fn protocol_specs_print_back_as_parsed(spec: &str) {
        let parsed: ProtocolSpec = assert_ok!(spec.parse());
        assert_eq!(parsed.to_string(), spec);
    }

    #[test]
    fn parsed_fields_land_in_place() {
        assert_ok_eq!(
            "Loom:8:512:TRUE:FALSE".parse::<ProtocolSpec>(),
            ProtocolSpec::Loom {
                threads: 8,
                partitions: 512,
                inter_block: true,
                nested_reexecution: false,
            }
        );
        assert_ok_eq!("Serial:4".parse::<ProtocolSpec>().map(|spec| spec.threads()), 1);
    }

    #[test]
    fn unknown_protocol_is_named() {
        let err = assert_err!("Calvin:4:4".parse::<ProtocolSpec>());
        assert_eq!(err.to_string(), "unknown protocol option (Calvin)");
    }

    #[test]
    fn argument_count_mismatch_shows_the_signature() {
        let err = assert_err!("Aria:4:64".parse::<ProtocolSpec>());
        assert_eq!(
            err.to_string(),
            "protocol Aria has 3 args -- (THREADS, PARTITIONS, REORDERING), but we found 2 args"
        );
    }

    #[test_case("Aria:4:64:true"; "lower case")]
    #[test_case("Harmony:4:64:1"; "digit")]
    #[test_case("Loom:4:64:TRUE:yes"; "second flag")]
    fn booleans_must_be_upper_case_words(spec: &str) {
        let err = assert_err!(spec.parse::<ProtocolSpec>());
        assert!(matches!(err, ConfigError::InvalidBool(_)));
        assert!(err.to_string().ends_with("as boolean should be either TRUE or FALSE"));
    }

    #[test]
    fn invalid_integers_and_zero_threads_are_rejected() {
        assert!(matches!(
            "Moss:four:64".parse::<ProtocolSpec>(),
            Err(ConfigError::InvalidInteger(value)) if value == "four"
        ));
        assert!(matches!(
            "OptME:0:64".parse::<ProtocolSpec>(),
            Err(ConfigError::ZeroThreads(name)) if name == "OptME"
        ));
    }

    #[test]
    fn workload_spec() {
        assert_ok_eq!("TPCC:4:1000:20:TRUE".parse::<WorkloadSpec>(), WorkloadSpec {
            warehouses: 4,
            block_size: 1000,
            num_blocks: 20,
            nested: true,
        });
        assert!(matches!(
            "YCSB:1:2:3:FALSE".parse::<WorkloadSpec>(),
            Err(ConfigError::UnknownWorkload(name)) if name == "YCSB"
        ));
        let err = assert_err!("TPCC:4:1000".parse::<WorkloadSpec>());
        assert_eq!(
            err.to_string(),
            "protocol TPCC has 4 args -- (WAREHOUSES, BLOCK_SIZE, NUM_BLOCKS, NESTED), but we found 2 args"
        );
    }

    #[test_case("250ms", Duration::from_millis(250))]
    #[test_case("3s", Duration::from_secs(3))]
    #[test_case("2m", Duration::from_secs(120))]
    #[test_case("1h", Duration::from_secs(3600))]
    fn duration_suffixes(s: &str, expected: Duration) {
        assert_ok_eq!(parse_duration(s), expected);
    }

    #[test_case(""; "empty")]
    #[test_case("10"; "no unit")]
    #[test_case("s"; "no amount")]
    #[test_case("5d"; "unknown unit")]
    #[test_case("1.5s"; "fraction")]
    fn invalid_durations(s: &str) {
        assert!(matches!(parse_duration(s), Err(ConfigError::InvalidDuration(_))));
    }

    #[test]
    fn yaml_config_resolves_to_a_plan() {
        let config = assert_ok!(BenchConfig::from_yaml(
            "protocol: Harmony:4:64:FALSE\nworkload: TPCC:1:100:5:FALSE\nduration: 2s\nseed: 9\n"
        ));
        assert_ok_eq!(config.resolve(), BenchPlan {
            protocol: ProtocolSpec::Harmony {
                threads: 4,
                partitions: 64,
                inter_block: false,
            },
            workload: WorkloadSpec {
                warehouses: 1,
                block_size: 100,
                num_blocks: 5,
                nested: false,
            },
            duration: Duration::from_secs(2),
            seed: 9,
        });
    }

    #[test]
    fn yaml_config_rejects_unknown_fields() {
        assert!(matches!(
            BenchConfig::from_yaml("protocol: Serial:1\nworkload: TPCC:1:1:1:FALSE\nduration: 1s\nthreads: 3\n"),
            Err(ConfigError::Yaml(_))
        ));
    }
}
