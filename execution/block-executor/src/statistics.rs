// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::counters::{
    BLOCK_COUNT, TXN_COMMIT_COUNT, TXN_COMMIT_LATENCY_SECONDS, TXN_EXECUTION_COUNT,
    TXN_OVERHEAD_COUNT, TXN_ROLLBACK_COUNT,
};
use crossbeam::utils::CachePadded;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

/// Process-local sink protocols journal their progress into. All journal calls are lock-free and
/// can be issued from any worker; each one also bumps the matching prometheus counter.
pub struct Statistics {
    protocol: String,
    created_at: Instant,
    commit: CachePadded<AtomicU64>,
    execution: CachePadded<AtomicU64>,
    overhead: CachePadded<AtomicU64>,
    rollback: CachePadded<AtomicU64>,
    block: AtomicU64,
    latency_us: CachePadded<AtomicU64>,
    rollback_execution_us: AtomicU64,
    re_execution_us: AtomicU64,
    // Nanoseconds since `created_at`. u64::MAX / 0 until the first commit.
    first_commit_ns: AtomicU64,
    last_commit_ns: AtomicU64,
}

impl Statistics {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            created_at: Instant::now(),
            commit: CachePadded::new(AtomicU64::new(0)),
            execution: CachePadded::new(AtomicU64::new(0)),
            overhead: CachePadded::new(AtomicU64::new(0)),
            rollback: CachePadded::new(AtomicU64::new(0)),
            block: AtomicU64::new(0),
            latency_us: CachePadded::new(AtomicU64::new(0)),
            rollback_execution_us: AtomicU64::new(0),
            re_execution_us: AtomicU64::new(0),
            first_commit_ns: AtomicU64::new(u64::MAX),
            last_commit_ns: AtomicU64::new(0),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn journal_commit(&self, latency_us: u64) {
        let now_ns = self.created_at.elapsed().as_nanos() as u64;
        self.first_commit_ns.fetch_min(now_ns, Ordering::Relaxed);
        self.last_commit_ns.fetch_max(now_ns, Ordering::Relaxed);
        self.commit.fetch_add(1, Ordering::Relaxed);
        self.latency_us.fetch_add(latency_us, Ordering::Relaxed);

        TXN_COMMIT_COUNT.with_label_values(&[self.protocol.as_str()]).inc();
        TXN_COMMIT_LATENCY_SECONDS
            .with_label_values(&[self.protocol.as_str()])
            .observe(latency_us as f64 / 1e6);
    }

    pub fn journal_execute(&self) {
        self.execution.fetch_add(1, Ordering::Relaxed);
        TXN_EXECUTION_COUNT.with_label_values(&[self.protocol.as_str()]).inc();
    }

    pub fn journal_overheads(&self, units: u64) {
        self.overhead.fetch_add(units, Ordering::Relaxed);
        TXN_OVERHEAD_COUNT
            .with_label_values(&[self.protocol.as_str()])
            .inc_by(units);
    }

    pub fn journal_rollback(&self, units: u64) {
        self.rollback.fetch_add(units, Ordering::Relaxed);
        TXN_ROLLBACK_COUNT
            .with_label_values(&[self.protocol.as_str()])
            .inc_by(units);
    }

    pub fn journal_block(&self) {
        self.block.fetch_add(1, Ordering::Relaxed);
        BLOCK_COUNT.with_label_values(&[self.protocol.as_str()]).inc();
    }

    pub fn journal_rollback_execution(&self, us: u64) {
        self.rollback_execution_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn journal_re_execution(&self, us: u64) {
        self.re_execution_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn commits(&self) -> u64 {
        self.commit.load(Ordering::Relaxed)
    }

    pub fn executions(&self) -> u64 {
        self.execution.load(Ordering::Relaxed)
    }

    pub fn blocks(&self) -> u64 {
        self.block.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> StatisticsReport {
        let commit = self.commits();
        let first = self.first_commit_ns.load(Ordering::Relaxed);
        let last = self.last_commit_ns.load(Ordering::Relaxed);
        let window_secs = if commit > 0 && last > first {
            (last - first) as f64 / 1e9
        } else {
            0.0
        };
        let mean_latency_ms = if commit > 0 {
            self.latency_us.load(Ordering::Relaxed) as f64 / commit as f64 / 1e3
        } else {
            0.0
        };
        StatisticsReport {
            protocol: self.protocol.clone(),
            commit,
            execution: self.executions(),
            overhead: self.overhead.load(Ordering::Relaxed),
            rollback: self.rollback.load(Ordering::Relaxed),
            block: self.blocks(),
            rollback_execution_us: self.rollback_execution_us.load(Ordering::Relaxed),
            re_execution_us: self.re_execution_us.load(Ordering::Relaxed),
            mean_latency_ms,
            tps: if window_secs > 0.0 {
                commit as f64 / window_secs
            } else {
                0.0
            },
        }
    }
}

/// Point-in-time copy of the journal. `Display` renders the human readable summary.
#[derive(Clone, Debug, PartialEq)]
pub struct StatisticsReport {
    pub protocol: String,
    pub commit: u64,
    pub execution: u64,
    pub overhead: u64,
    pub rollback: u64,
    pub block: u64,
    pub rollback_execution_us: u64,
    pub re_execution_us: u64,
    pub mean_latency_ms: f64,
    pub tps: f64,
}

impl fmt::Display for StatisticsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", chrono::Local::now().format("%F %T"))?;
        writeln!(f, "commit             {}", self.commit)?;
        writeln!(f, "execution          {}", self.execution)?;
        writeln!(f, "overhead           {}", self.overhead)?;
        writeln!(f, "latency            {:.4} ms", self.mean_latency_ms)?;
        write!(f, "tps                {:.4} tx/s", self.tps)
    }
}
