//! Key-partitioned log writer pool.
//!
//! N lanes, each a bounded queue drained by a dedicated thread. A record's
//! partition key picks its lane by hash, so all records for one key go
//! through one queue and reach the WAL in submission order. The lanes share
//! the node-wide append lock; the pool exists for pipelining and
//! backpressure, not for parallel file writes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use super::store::WalStore;
use super::Position;
use crate::error::WalError;

/// One writer lane: a bounded FIFO of pending records plus its drain thread's
/// coordination state.
struct Lane {
    queue: Mutex<VecDeque<Vec<u8>>>,
    /// Signaled when the queue gains an item (wakes the drain thread).
    read_cond: Condvar,
    /// Signaled when the queue loses an item (wakes blocked submitters).
    write_cond: Condvar,
    /// Set when an append from this lane failed.
    io_error: AtomicBool,
}

impl Lane {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            read_cond: Condvar::new(),
            write_cond: Condvar::new(),
            io_error: AtomicBool::new(false),
        }
    }
}

struct Shared {
    lanes: Vec<Lane>,
    store: Arc<Mutex<WalStore>>,
    max_queue_len: usize,
    /// Aggregate of the per-lane flags; one failed lane fails all submits.
    io_error: AtomicBool,
    stopping: AtomicBool,
}

/// Partitioned asynchronous front door to the WAL.
///
/// `submit` enqueues onto the lane chosen by the partition key and applies
/// backpressure when that lane is full. A synchronous submit bypasses the
/// lanes entirely and appends under the store lock directly, which also
/// serializes it against every lane's in-flight drains.
pub struct LogWriterPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LogWriterPool {
    /// Spawns `lane_count` drain threads in front of `store`.
    ///
    /// `max_queue_len` bounds each lane's queue; submitters to a full lane
    /// block until the drain thread catches up.
    #[must_use]
    pub fn new(store: Arc<Mutex<WalStore>>, lane_count: usize, max_queue_len: usize) -> Self {
        assert!(lane_count > 0, "writer pool needs at least one lane");
        assert!(max_queue_len > 0, "lane queues need capacity");

        let shared = Arc::new(Shared {
            lanes: (0..lane_count).map(|_| Lane::new()).collect(),
            store,
            max_queue_len,
            io_error: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        });

        let handles = (0..lane_count)
            .map(|lane_index| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("wal-writer-{lane_index}"))
                    .spawn(move || drain_lane(&shared, lane_index))
                    .unwrap_or_else(|e| panic!("failed to spawn wal-writer-{lane_index}: {e}"))
            })
            .collect();

        info!(lane_count, max_queue_len, "log writer pool started");
        Self {
            shared,
            handles: Mutex::new(handles),
        }
    }

    /// Returns the lane a partition key maps to. Submissions with the same
    /// key always share a lane, hence a FIFO.
    #[must_use]
    pub fn lane_for(&self, partition_key: &[u8]) -> usize {
        fxhash::hash(partition_key) % self.shared.lanes.len()
    }

    /// Submits a record for appending.
    ///
    /// Asynchronous (`synchronous == false`): enqueues onto the key's lane,
    /// blocking while the lane is full, and returns once enqueued. The append
    /// happens later on the drain thread; failures there latch the error flag
    /// instead of reaching this caller.
    ///
    /// Synchronous: takes the store lock and appends before returning, giving
    /// back the record's position.
    ///
    /// # Errors
    ///
    /// - [`WalError::WritePathDisabled`] if any lane has hit an IO error.
    /// - [`WalError::Stopped`] if the pool is shutting down, including for
    ///   submitters that were blocked on a full lane when shutdown began.
    /// - Synchronous submits additionally surface the append error itself.
    pub fn submit(
        &self,
        partition_key: &[u8],
        record: Vec<u8>,
        synchronous: bool,
    ) -> Result<Option<Position>, WalError> {
        if self.shared.io_error.load(Ordering::Acquire) {
            return Err(WalError::WritePathDisabled);
        }
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(WalError::Stopped);
        }

        if synchronous {
            let mut store = self.shared.store.lock();
            let position = store.append(&record).inspect_err(|e| {
                error!(error = %e, "synchronous append failed");
                self.shared.io_error.store(true, Ordering::Release);
            })?;
            return Ok(Some(position));
        }

        let lane = &self.shared.lanes[self.lane_for(partition_key)];
        let mut queue = lane.queue.lock();
        while queue.len() >= self.shared.max_queue_len {
            if self.shared.stopping.load(Ordering::Acquire) {
                return Err(WalError::Stopped);
            }
            lane.write_cond.wait(&mut queue);
        }
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(WalError::Stopped);
        }
        queue.push_back(record);
        lane.read_cond.notify_one();
        Ok(None)
    }

    /// Whether the write path is currently disabled by an earlier failure.
    #[must_use]
    pub fn io_error(&self) -> bool {
        self.shared.io_error.load(Ordering::Acquire)
    }

    /// Operator override for the error latch.
    ///
    /// Setting it disables the write path; clearing it re-enables submits
    /// after the underlying disk problem has been resolved.
    pub fn set_io_error(&self, value: bool) {
        self.shared.io_error.store(value, Ordering::Release);
        if !value {
            for lane in &self.shared.lanes {
                lane.io_error.store(false, Ordering::Release);
            }
        }
        warn!(value, "write path error flag set by operator");
    }

    /// Stops accepting submissions, drains what is already queued, and joins
    /// the drain threads. Blocked submitters are released with
    /// [`WalError::Stopped`]. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        for lane in &self.shared.lanes {
            // take each lock so sleepers observe the flag, then wake everyone
            drop(lane.queue.lock());
            lane.read_cond.notify_all();
            lane.write_cond.notify_all();
        }
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                error!("wal writer thread panicked");
            }
        }
        info!("log writer pool stopped");
    }
}

impl Drop for LogWriterPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LogWriterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriterPool")
            .field("lanes", &self.shared.lanes.len())
            .field("io_error", &self.io_error())
            .finish_non_exhaustive()
    }
}

fn drain_lane(shared: &Shared, lane_index: usize) {
    let lane = &shared.lanes[lane_index];
    loop {
        let record = {
            let mut queue = lane.queue.lock();
            loop {
                if let Some(record) = queue.pop_front() {
                    lane.write_cond.notify_one();
                    break record;
                }
                if shared.stopping.load(Ordering::Acquire) {
                    return;
                }
                lane.read_cond.wait(&mut queue);
            }
        };

        // after a failure, keep draining but stop writing: the queue must
        // empty out so blocked submitters can observe the error and unwind
        if lane.io_error.load(Ordering::Acquire) {
            continue;
        }

        let result = shared.store.lock().append(&record);
        if let Err(e) = result {
            error!(lane = lane_index, error = %e, "append failed, disabling write path");
            lane.io_error.store(true, Ordering::Release);
            shared.io_error.store(true, Ordering::Release);
        }
    }
}
