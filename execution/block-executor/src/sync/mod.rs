// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

mod barrier;
mod signal;
mod spin_lock;

pub use barrier::{ExitCoordinator, ExitState, PhaseBarrier};
pub use signal::{CompletionSignal, RetryNotifier, RetryTicket, TurnSequencer};
pub use spin_lock::{SpinLock, SpinLockGuard};
