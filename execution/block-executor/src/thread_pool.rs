// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    affinity::pin_round_robin,
    errors::{ExecutorError, ExecutorResult},
};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;
use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    thread::{self, JoinHandle},
};
use tracing::{error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named worker threads fed from one FIFO queue. Tasks start in submission
/// order, which lets protocols that block inside tasks (waiting for an earlier transaction) rely
/// on earlier tasks already being picked up.
pub struct ThreadPool {
    name: String,
    num_threads: usize,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(name: &str, num_threads: usize, pin_threads: bool) -> ExecutorResult<Self> {
        let num_threads = num_threads.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(num_threads);
        for index in 0..num_threads {
            let receiver = receiver.clone();
            let thread_name = format!("{}-{}", name, index);
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    if pin_threads {
                        pin_round_robin(index);
                    }
                    run_worker(receiver)
                })
                .map_err(|source| ExecutorError::ThreadSpawn {
                    name: thread_name,
                    source,
                })?;
            workers.push(handle);
        }

        Ok(Self {
            name: name.to_string(),
            num_threads,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Queues `task` and returns a handle to its result.
    pub fn spawn<F, R>(&self, task: F) -> ExecutorResult<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = bounded(1);
        let job: Job = Box::new(move || {
            // The receiver may have been dropped by a caller that does not need the result.
            let _ = result_tx.send(task());
        });
        let sender = self.sender.lock();
        sender
            .as_ref()
            .ok_or_else(|| ExecutorError::PoolShutdown(self.name.clone()))?
            .send(job)
            .map_err(|_| ExecutorError::PoolShutdown(self.name.clone()))?;
        Ok(TaskHandle {
            pool: self.name.clone(),
            receiver: result_rx,
        })
    }

    /// Stops accepting tasks, lets the workers drain the queue and joins them. Idempotent.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!(pool = %self.name, "pool worker panicked");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!(
                thread = thread::current().name().unwrap_or("unnamed"),
                "task panicked"
            );
        }
    }
}

/// Result slot of a task submitted to a `ThreadPool`.
#[derive(Debug)]
pub struct TaskHandle<R> {
    pool: String,
    receiver: Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Blocks until the task ran. Fails if the task panicked.
    pub fn join(self) -> ExecutorResult<R> {
        self.receiver
            .recv()
            .map_err(|_| ExecutorError::TaskPanicked(self.pool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok_eq};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn tasks_return_results() {
        let pool = ThreadPool::new("test-pool", 3, false).unwrap();
        assert_eq!(pool.num_threads(), 3);
        let handles: Vec<_> = (0..20usize)
            .map(|i| pool.spawn(move || i * 2).unwrap())
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_ok_eq!(handle.join(), i * 2);
        }
    }

    #[test]
    fn panicking_task_fails_its_handle_only() {
        let pool = ThreadPool::new("test-pool", 1, false).unwrap();
        let bad = pool.spawn(|| -> usize { panic!("boom") }).unwrap();
        let good = pool.spawn(|| 7usize).unwrap();
        assert_err!(bad.join());
        assert_ok_eq!(good.join(), 7);
    }

    #[test]
    fn shutdown_drains_queue_and_rejects_new_tasks() {
        let pool = ThreadPool::new("test-pool", 2, false).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_err!(pool.spawn(|| ()));
    }
}
