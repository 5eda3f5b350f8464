// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use parking_lot::{Condvar, Mutex};

/// One-shot notification: once signaled it stays signaled, and every current or future waiter
/// returns immediately.
#[derive(Default)]
pub struct CompletionSignal {
    done: Mutex<bool>,
    cvar: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cvar.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.done.lock()
    }

    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cvar.wait(&mut done);
        }
    }
}

/// Hands out turns in increasing index order. `next` is the index whose turn it currently is;
/// every index below it has finished its turn.
pub struct TurnSequencer {
    next: Mutex<usize>,
    cvar: Condvar,
}

impl TurnSequencer {
    pub fn new(first: usize) -> Self {
        Self {
            next: Mutex::new(first),
            cvar: Condvar::new(),
        }
    }

    pub fn current(&self) -> usize {
        *self.next.lock()
    }

    pub fn has_finished(&self, index: usize) -> bool {
        *self.next.lock() > index
    }

    /// Blocks until `interrupted()` holds (returns false) or it is `index`'s turn (returns true).
    /// The interruption is checked first. Whoever makes `interrupted()` true must call `wake()`
    /// afterwards.
    pub fn wait_for_turn_or(&self, index: usize, interrupted: impl Fn() -> bool) -> bool {
        let mut next = self.next.lock();
        loop {
            if interrupted() {
                return false;
            }
            if *next == index {
                return true;
            }
            self.cvar.wait(&mut next);
        }
    }

    /// Blocks until `index` has finished its turn.
    pub fn wait_finished(&self, index: usize) {
        let mut next = self.next.lock();
        while *next <= index {
            self.cvar.wait(&mut next);
        }
    }

    /// Ends the current turn and wakes every waiter.
    pub fn advance(&self) {
        let mut next = self.next.lock();
        *next += 1;
        self.cvar.notify_all();
    }

    /// Wakes every waiter so it re-evaluates its interruption condition.
    pub fn wake(&self) {
        let _guard = self.next.lock();
        self.cvar.notify_all();
    }
}

/// Ticket returned by `RetryNotifier::reset_retry`: the generation the caller must see change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryTicket(u64);

/// Generation-counting condition used to park work that must retry once some earlier work has
/// made progress. A waiter takes a ticket before releasing what it holds, so a notification that
/// happens in between is never missed.
#[derive(Default)]
pub struct RetryNotifier {
    generation: Mutex<u64>,
    cvar: Condvar,
}

impl RetryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_retry(&self) -> RetryTicket {
        RetryTicket(*self.generation.lock())
    }

    pub fn wait_retry(&self, ticket: RetryTicket) {
        let mut generation = self.generation.lock();
        while *generation == ticket.0 {
            self.cvar.wait(&mut generation);
        }
    }

    pub fn notify_retry(&self) {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.cvar.notify_all();
    }
}
