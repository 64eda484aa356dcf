//! Key-partitioned apply worker pool.
//!
//! Replicated commands for the same key must apply in log order, commands
//! for different keys may apply in parallel. Each worker owns a queue;
//! tasks are routed by key hash, so one key always lands on one worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

/// A unit of apply work.
pub type ApplyTask = Box<dyn FnOnce() + Send>;

struct Worker {
    queue: Mutex<VecDeque<ApplyTask>>,
    cond: Condvar,
}

struct Shared {
    workers: Vec<Worker>,
    stopping: AtomicBool,
}

/// Fixed pool of apply workers, partitioned by key.
pub struct ApplyPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ApplyPool {
    /// Spawns `worker_count` apply threads.
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        assert!(worker_count > 0, "apply pool needs at least one worker");
        let shared = Arc::new(Shared {
            workers: (0..worker_count)
                .map(|_| Worker {
                    queue: Mutex::new(VecDeque::new()),
                    cond: Condvar::new(),
                })
                .collect(),
            stopping: AtomicBool::new(false),
        });

        let handles = (0..worker_count)
            .map(|worker_index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("apply-{worker_index}"))
                    .spawn(move || run_worker(&shared, worker_index))
                    .unwrap_or_else(|e| panic!("failed to spawn apply-{worker_index}: {e}"))
            })
            .collect();

        info!(worker_count, "apply pool started");
        Self {
            shared,
            handles: Mutex::new(handles),
        }
    }

    /// The worker a partition key maps to.
    #[must_use]
    pub fn worker_for(&self, partition_key: &[u8]) -> usize {
        fxhash::hash(partition_key) % self.shared.workers.len()
    }

    /// Enqueues a task on the key's worker. Tasks for one key run in
    /// dispatch order. Tasks dispatched after shutdown are dropped.
    pub fn dispatch(&self, partition_key: &[u8], task: ApplyTask) {
        if self.shared.stopping.load(Ordering::Acquire) {
            return;
        }
        let worker = &self.shared.workers[self.worker_for(partition_key)];
        worker.queue.lock().push_back(task);
        worker.cond.notify_one();
    }

    /// Drains the queues and joins the workers. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in &self.shared.workers {
            drop(worker.queue.lock());
            worker.cond.notify_all();
        }
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                error!("apply worker panicked");
            }
        }
        info!("apply pool stopped");
    }
}

impl Drop for ApplyPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ApplyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyPool")
            .field("workers", &self.shared.workers.len())
            .finish_non_exhaustive()
    }
}

fn run_worker(shared: &Shared, worker_index: usize) {
    let worker = &shared.workers[worker_index];
    loop {
        let task = {
            let mut queue = worker.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                if shared.stopping.load(Ordering::Acquire) {
                    return;
                }
                worker.cond.wait(&mut queue);
            }
        };
        task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_all_tasks_run() {
        let pool = ApplyPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..100u32 {
            let counter = Arc::clone(&counter);
            let key = format!("key-{i}");
            pool.dispatch(key.as_bytes(), Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_same_key_runs_in_dispatch_order() {
        let pool = ApplyPool::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50u32 {
            let seen = Arc::clone(&seen);
            pool.dispatch(b"one-key", Box::new(move || {
                // stagger to catch reordering if it existed
                thread::sleep(Duration::from_micros(100));
                seen.lock().push(i);
            }));
        }
        pool.shutdown();
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_same_key_same_worker() {
        let pool = ApplyPool::new(8);
        let w = pool.worker_for(b"stable-key");
        for _ in 0..10 {
            assert_eq!(pool.worker_for(b"stable-key"), w);
        }
    }

    #[test]
    fn test_dispatch_after_shutdown_is_dropped() {
        let pool = ApplyPool::new(2);
        pool.shutdown();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        pool.dispatch(b"k", Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(!ran.load(Ordering::SeqCst));
    }
}
