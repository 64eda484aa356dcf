//! Replica-side sync coordinator.
//!
//! Tracks which master this node follows and how far the link bring-up has
//! progressed. A replica holds two sub-links to its master, the heartbeat
//! connection and the log stream, and only counts as connected once both
//! are up. Losing either one drops the replica back to `Connect` so the
//! handshake loop retries.

use parking_lot::RwLock;
use tracing::{info, warn};

/// Replication state of this node, as seen by the sync coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplState {
    /// Not a replica; no master configured.
    NoConnect,
    /// Master configured, handshake not started or due for retry.
    Connect,
    /// Handshake sent, links coming up.
    Connecting,
    /// Both sub-links up; streaming.
    Connected,
    /// Master refused incremental sync; waiting for the snapshot transfer.
    WaitDbSync,
    /// Unrecoverable handshake failure; operator attention needed.
    Error,
}

/// Address of the configured master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterInfo {
    /// Master control-port IP.
    pub ip: String,
    /// Master control port.
    pub port: u16,
}

/// Number of sub-links a fully connected replica maintains.
const FULL_LINK_COUNT: u8 = 2;

struct Inner {
    master: Option<MasterInfo>,
    state: ReplState,
    link_count: u8,
    force_full_sync: bool,
    session_id: Option<u64>,
}

/// State machine for this node's role as a replica.
pub struct SyncCoordinator {
    inner: RwLock<Inner>,
}

impl SyncCoordinator {
    /// Creates a coordinator in the `NoConnect` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                master: None,
                state: ReplState::NoConnect,
                link_count: 0,
                force_full_sync: false,
                session_id: None,
            }),
        }
    }

    /// Configures a master to follow. `force` requests a full resync from
    /// the start of the master's log instead of resuming at the local
    /// producer position. Replaces any previously configured master.
    pub fn set_master(&self, ip: &str, port: u16, force: bool) {
        let mut inner = self.inner.write();
        let master = MasterInfo {
            ip: ip.to_string(),
            port,
        };
        info!(master = format!("{ip}:{port}"), force, "following master");
        inner.master = Some(master);
        inner.state = ReplState::Connect;
        inner.link_count = 0;
        inner.force_full_sync = force;
        inner.session_id = None;
    }

    /// Stops following a master and reopens the node for writes.
    pub fn remove_master(&self) {
        let mut inner = self.inner.write();
        if inner.master.take().is_some() {
            info!("no longer a replica");
        }
        inner.state = ReplState::NoConnect;
        inner.link_count = 0;
        inner.force_full_sync = false;
        inner.session_id = None;
    }

    /// Claims the handshake: `Connect` moves to `Connecting` and returns the
    /// master to dial. Returns `None` when no handshake is due.
    #[must_use]
    pub fn begin_handshake(&self) -> Option<MasterInfo> {
        let mut inner = self.inner.write();
        if inner.state != ReplState::Connect {
            return None;
        }
        inner.state = ReplState::Connecting;
        inner.master.clone()
    }

    /// Records the session id the master assigned during TRYSYNC.
    pub fn handshake_accepted(&self, session_id: u64) {
        let mut inner = self.inner.write();
        inner.session_id = Some(session_id);
        inner.force_full_sync = false;
    }

    /// Enters the snapshot-wait state after the master refused incremental
    /// sync.
    pub fn wait_snapshot(&self) {
        let mut inner = self.inner.write();
        inner.state = ReplState::WaitDbSync;
        inner.link_count = 0;
    }

    /// Snapshot finished loading; go back and handshake again from the
    /// snapshot's log position.
    pub fn snapshot_loaded(&self) {
        let mut inner = self.inner.write();
        if inner.state == ReplState::WaitDbSync {
            inner.state = ReplState::Connect;
        }
    }

    /// Marks one sub-link up. At two live links the replica is `Connected`.
    pub fn link_up(&self) {
        let mut inner = self.inner.write();
        if inner.master.is_none() {
            return;
        }
        inner.link_count = (inner.link_count + 1).min(FULL_LINK_COUNT);
        if inner.link_count == FULL_LINK_COUNT && inner.state == ReplState::Connecting {
            inner.state = ReplState::Connected;
            info!("both replication links up, replica connected");
        }
    }

    /// Marks one sub-link lost. Any loss drops the replica back to
    /// `Connect` for a handshake retry, unless a snapshot is in flight.
    pub fn link_lost(&self) {
        let mut inner = self.inner.write();
        if inner.master.is_none() || inner.state == ReplState::WaitDbSync {
            return;
        }
        inner.link_count = inner.link_count.saturating_sub(1);
        if inner.state == ReplState::Connected || inner.state == ReplState::Connecting {
            warn!("replication link lost, will re-handshake");
            inner.state = ReplState::Connect;
        }
    }

    /// Flags an unrecoverable handshake failure.
    pub fn set_error(&self) {
        self.inner.write().state = ReplState::Error;
    }

    /// Current replication state.
    #[must_use]
    pub fn state(&self) -> ReplState {
        self.inner.read().state
    }

    /// The configured master, if any.
    #[must_use]
    pub fn master(&self) -> Option<MasterInfo> {
        self.inner.read().master.clone()
    }

    /// Whether a full resync was requested for the next handshake.
    #[must_use]
    pub fn force_full_sync(&self) -> bool {
        self.inner.read().force_full_sync
    }

    /// Session id assigned by the master, once the handshake succeeded.
    #[must_use]
    pub fn session_id(&self) -> Option<u64> {
        self.inner.read().session_id
    }

    /// Replicas reject local writes; only the replication stream mutates
    /// them.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.read().master.is_some()
    }
}

impl Default for SyncCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("SyncCoordinator")
            .field("state", &inner.state)
            .field("master", &inner.master)
            .field("link_count", &inner.link_count)
            .finish_non_exhaustive()
    }
}
