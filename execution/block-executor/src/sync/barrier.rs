// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type CompletionFn = Box<dyn Fn(u64) + Send + Sync>;

struct BarrierState {
    arrived: usize,
    // Workers still taking part; shrinks when a worker leaves for good.
    participants: usize,
    generation: u64,
}

/// Reusable rendezvous for a fixed set of workers. Every time the last worker of a generation
/// arrives, the optional completion callback runs (while the others are still blocked), the
/// generation counter advances and everyone is released.
pub struct PhaseBarrier {
    num_workers: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
    on_complete: Option<CompletionFn>,
}

impl PhaseBarrier {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            state: Mutex::new(BarrierState {
                arrived: 0,
                participants: num_workers.max(1),
                generation: 0,
            }),
            cvar: Condvar::new(),
            on_complete: None,
        }
    }

    /// The callback receives the generation that just completed.
    pub fn with_completion(num_workers: usize, on_complete: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            on_complete: Some(Box::new(on_complete)),
            ..Self::new(num_workers)
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Number of completed rendezvous so far.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Blocks until all workers of the current generation have arrived. Returns true for exactly
    /// one worker per generation (the last to arrive).
    pub fn arrive_and_wait(&self) -> bool {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived >= state.participants {
            self.complete(&mut state);
            return true;
        }
        while state.generation == generation {
            self.cvar.wait(&mut state);
        }
        false
    }

    /// Removes the calling worker from every later rendezvous. If everyone else already arrived
    /// at the current one, it completes.
    pub fn leave(&self) {
        let mut state = self.state.lock();
        state.participants = state.participants.saturating_sub(1);
        if state.participants > 0 && state.arrived >= state.participants {
            self.complete(&mut state);
        }
    }

    fn complete(&self, state: &mut BarrierState) {
        if let Some(on_complete) = &self.on_complete {
            on_complete(state.generation);
        }
        state.arrived = 0;
        state.generation += 1;
        self.cvar.notify_all();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitState {
    Running,
    /// A stop was requested, not every worker has acknowledged it yet.
    DrainRequested,
    /// Every worker acknowledged the stop; the next rendezvous is the last one.
    AllConfirmed,
}

/// Coordinates a cooperative shutdown of barrier-synchronized workers, so that every worker leaves
/// at the same rendezvous and none is left waiting on a barrier that will never complete.
///
/// Workers call `state()` right before their first rendezvous of a batch and `confirm()` (once,
/// after observing `is_requested()`) somewhere between two rendezvous. Since confirmations are
/// always separated from the next `state()` reads by a rendezvous, all workers observe the same
/// state at the same batch.
pub struct ExitCoordinator {
    num_workers: usize,
    requested: AtomicBool,
    confirmed: AtomicUsize,
}

impl ExitCoordinator {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            requested: AtomicBool::new(false),
            confirmed: AtomicUsize::new(0),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Records one worker's acknowledgement and returns the updated count.
    pub fn confirm(&self) -> usize {
        self.confirmed.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn state(&self) -> ExitState {
        if !self.is_requested() {
            ExitState::Running
        } else if self.confirmed.load(Ordering::Acquire) >= self.num_workers {
            ExitState::AllConfirmed
        } else {
            ExitState::DrainRequested
        }
    }
}
