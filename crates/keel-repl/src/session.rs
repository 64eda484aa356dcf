//! Replica session registry on the master.
//!
//! A replica shows up in two steps: the TRYSYNC handshake registers the
//! session and spawns its log sender, then the heartbeat link confirms it.
//! Only sessions with a running sender count toward the purge floor, and an
//! unreported sender forbids purging entirely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use keel_storage::SenderPositions;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::ReplError;

/// Lifecycle stage of a replica session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    /// Handshake accepted, heartbeat link not yet confirmed.
    Requested,
    /// Heartbeat link confirmed; the replica is a live follower.
    Established,
}

/// Shared handle to a running log sender thread.
///
/// The sender publishes the file index it is reading through `file_index`
/// so retention can compute the purge floor without touching the thread.
#[derive(Debug)]
pub struct SenderHandle {
    file_index: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SenderHandle {
    /// Creates a handle around a spawned sender thread.
    #[must_use]
    pub fn new(file_index: Arc<AtomicU32>, stop: Arc<AtomicBool>, handle: JoinHandle<()>) -> Self {
        Self {
            file_index,
            stop,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// The log file the sender is currently reading.
    #[must_use]
    pub fn file_index(&self) -> u32 {
        self.file_index.load(Ordering::Acquire)
    }

    /// Asks the sender to stop and joins it. Safe to call from the sender's
    /// own thread: joining is skipped there and the thread just unwinds.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("log sender thread panicked");
            }
        }
    }
}

struct Session {
    sid: u64,
    stage: SessionStage,
    sender: Option<Arc<SenderHandle>>,
}

/// Registry of replica sessions, keyed by replica address (`ip:port`).
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    next_sid: AtomicU64,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_sid: AtomicU64::new(1),
        }
    }

    /// Registers a new session for `addr` and returns its session id.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::SessionExists`] if the address already has one.
    pub fn register(&self, addr: &str) -> Result<u64, ReplError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(addr) {
            return Err(ReplError::SessionExists {
                addr: addr.to_string(),
            });
        }
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        sessions.insert(
            addr.to_string(),
            Session {
                sid,
                stage: SessionStage::Requested,
                sender: None,
            },
        );
        info!(addr, sid, "replica session registered");
        Ok(sid)
    }

    /// Attaches a running log sender to the session.
    pub fn attach_sender(&self, addr: &str, sender: Arc<SenderHandle>) {
        if let Some(session) = self.sessions.lock().get_mut(addr) {
            session.sender = Some(sender);
        }
    }

    /// Promotes the session once its heartbeat link is confirmed.
    pub fn establish(&self, addr: &str) {
        if let Some(session) = self.sessions.lock().get_mut(addr) {
            if session.stage != SessionStage::Established {
                session.stage = SessionStage::Established;
                info!(addr, sid = session.sid, "replica session established");
            }
        }
    }

    /// Current stage of the session at `addr`, if any.
    #[must_use]
    pub fn stage(&self, addr: &str) -> Option<SessionStage> {
        self.sessions.lock().get(addr).map(|s| s.stage)
    }

    /// Session id for `addr`, if registered.
    #[must_use]
    pub fn session_id(&self, addr: &str) -> Option<u64> {
        self.sessions.lock().get(addr).map(|s| s.sid)
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no sessions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Removes the session, stopping its sender if one is attached.
    ///
    /// Called both by operator action and by the sender's own exit path;
    /// [`SenderHandle::stop`] tolerates being invoked from the sender thread.
    pub fn remove(&self, addr: &str) {
        let session = self.sessions.lock().remove(addr);
        if let Some(session) = session {
            info!(addr, sid = session.sid, "replica session removed");
            if let Some(sender) = session.sender {
                sender.stop();
            }
        }
    }

    /// Stops every sender and clears the registry.
    pub fn clear(&self) {
        let sessions: Vec<String> = self.sessions.lock().keys().cloned().collect();
        for addr in sessions {
            self.remove(&addr);
        }
    }
}

impl SenderPositions for SessionRegistry {
    fn sender_file_indexes(&self) -> Option<Vec<u32>> {
        let sessions = self.sessions.lock();
        let mut indexes = Vec::with_capacity(sessions.len());
        for session in sessions.values() {
            // a session whose sender is not up yet pins the whole log
            indexes.push(session.sender.as_ref()?.file_index());
        }
        Some(indexes)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_sender(file_index: u32) -> Arc<SenderHandle> {
        let index = Arc::new(AtomicU32::new(file_index));
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !thread_stop.load(Ordering::Acquire) {
                thread::sleep(std::time::Duration::from_millis(1));
            }
        });
        Arc::new(SenderHandle::new(index, stop, handle))
    }

    #[test]
    fn test_register_assigns_distinct_sids() {
        let registry = SessionRegistry::new();
        let a = registry.register("10.0.0.1:9221").unwrap();
        let b = registry.register("10.0.0.2:9221").unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_register_rejected() {
        let registry = SessionRegistry::new();
        registry.register("10.0.0.1:9221").unwrap();
        let err = registry.register("10.0.0.1:9221").unwrap_err();
        assert!(matches!(err, ReplError::SessionExists { .. }));
    }

    #[test]
    fn test_remove_then_reregister() {
        let registry = SessionRegistry::new();
        registry.register("10.0.0.1:9221").unwrap();
        registry.remove("10.0.0.1:9221");
        registry.register("10.0.0.1:9221").unwrap();
    }

    #[test]
    fn test_two_stage_establish() {
        let registry = SessionRegistry::new();
        registry.register("r:1").unwrap();
        assert_eq!(registry.stage("r:1"), Some(SessionStage::Requested));
        registry.establish("r:1");
        assert_eq!(registry.stage("r:1"), Some(SessionStage::Established));
    }

    #[test]
    fn test_unreported_sender_blocks_purge() {
        let registry = SessionRegistry::new();
        registry.register("r:1").unwrap();
        assert_eq!(registry.sender_file_indexes(), None);
    }

    #[test]
    fn test_sender_positions_reported() {
        let registry = SessionRegistry::new();
        registry.register("r:1").unwrap();
        registry.register("r:2").unwrap();
        registry.attach_sender("r:1", idle_sender(3));
        registry.attach_sender("r:2", idle_sender(7));

        let mut indexes = registry.sender_file_indexes().unwrap();
        indexes.sort_unstable();
        assert_eq!(indexes, vec![3, 7]);
        registry.clear();
    }

    #[test]
    fn test_no_sessions_reports_empty() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.sender_file_indexes(), Some(vec![]));
    }

    #[test]
    fn test_remove_stops_sender() {
        let registry = SessionRegistry::new();
        registry.register("r:1").unwrap();
        registry.attach_sender("r:1", idle_sender(0));
        registry.remove("r:1");
        assert!(registry.is_empty());
    }
}
