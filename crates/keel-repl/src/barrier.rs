//! Sequence barrier: turnstile for arrival-order WAL appends.
//!
//! The ingest pipeline stamps each decoded record with a sequence number and
//! fans records out across apply workers by key. Before a worker appends its
//! record to the WAL it waits its turn here, so the replica's log order
//! matches the master's even though decode and apply run in parallel.

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::ReplError;

struct State {
    next_expected: u64,
    closed: bool,
}

/// A monotonically advancing turnstile over sequence numbers.
#[derive(Debug)]
pub struct SequenceBarrier {
    state: Mutex<State>,
    cond: Condvar,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("next_expected", &self.next_expected)
            .field("closed", &self.closed)
            .finish()
    }
}

impl SequenceBarrier {
    /// Creates a barrier expecting sequence number 0 first.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_expected: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Blocks until `seq` is the next expected sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Disconnected`] if the barrier is closed while
    /// waiting (or was already closed). Callers must not append after this.
    pub fn wait_for(&self, seq: u64) -> Result<(), ReplError> {
        let mut state = self.state.lock();
        while state.next_expected != seq {
            if state.closed {
                return Err(ReplError::Disconnected);
            }
            self.cond.wait(&mut state);
        }
        if state.closed {
            return Err(ReplError::Disconnected);
        }
        Ok(())
    }

    /// Releases the turnstile to the next sequence number.
    ///
    /// Called by the holder after its append completes (or is abandoned);
    /// skipping this would wedge every later waiter.
    pub fn advance(&self) {
        let mut state = self.state.lock();
        state.next_expected += 1;
        self.cond.notify_all();
    }

    /// Closes the barrier, failing all current and future waiters.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
        debug!("sequence barrier closed");
    }

    /// Reopens the barrier at `start`. Used when a replica reconnects and
    /// the ingest pipeline restarts its numbering.
    pub fn reset(&self, start: u64) {
        let mut state = self.state.lock();
        state.next_expected = start;
        state.closed = false;
        self.cond.notify_all();
    }
}

impl Default for SequenceBarrier {
    fn default() -> Self {
        Self::new()
    }
}
