// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Unrecoverable lifecycle and resource failures. Conflicts between transactions are never
/// reported through this type: every protocol resolves them internally (fallback, rollback or
/// re-execution).
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("protocol {0} has already been started")]
    AlreadyStarted(&'static str),

    #[error("protocol {0} has not been started")]
    NotStarted(&'static str),

    #[error("failed to spawn thread {name}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// A worker (or the protocol driver) panicked; the panic payload is logged at join time.
    #[error("thread {0} panicked")]
    WorkerPanicked(String),

    /// A task submitted to the pool panicked before producing its result.
    #[error("task submitted to pool {0} panicked")]
    TaskPanicked(String),

    #[error("thread pool {0} has been shut down")]
    PoolShutdown(String),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
