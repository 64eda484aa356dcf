//! Node facade: one handle over the WAL, the writer and apply pools, the
//! session registry, retention, and both sides of replication.

use std::sync::Arc;
use std::time::Duration;

use keel_storage::{
    LogWriterPool, Position, RetentionConfig, RetentionManager, WalConfig, WalStore,
};
use parking_lot::Mutex;
use tracing::info;

use crate::apply::ApplyPool;
use crate::error::ReplError;
use crate::ingest::IngestPipeline;
use crate::protocol::{encode_command, Reply};
use crate::session::SessionRegistry;
use crate::state::SyncCoordinator;
use crate::sync::{ReplMaster, SnapshotTransfer};

/// Applies a replicated or recovered command to the data store.
pub trait CommandApplier: Send + Sync {
    /// Applies one decoded command.
    fn apply(&self, argv: &[Vec<u8>]);
}

/// Node construction knobs.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// WAL location and rotation settings.
    pub wal: WalConfig,
    /// Number of log writer lanes.
    pub writer_lanes: usize,
    /// Per-lane queue capacity.
    pub writer_queue_len: usize,
    /// Number of apply workers.
    pub apply_workers: usize,
    /// Log retention policy.
    pub retention: RetentionConfig,
    /// How often an idle log sender re-checks the WAL tail.
    pub sender_poll_interval: Duration,
}

impl NodeConfig {
    /// Defaults sized for a small node.
    #[must_use]
    pub fn new(wal: WalConfig) -> Self {
        Self {
            wal,
            writer_lanes: 4,
            writer_queue_len: 1024,
            apply_workers: 4,
            retention: RetentionConfig::default(),
            sender_poll_interval: Duration::from_millis(100),
        }
    }
}

/// A replication-capable node: master and replica roles share this one
/// structure, the sync coordinator decides which role is active.
pub struct ReplNode {
    store: Arc<Mutex<WalStore>>,
    writer: Arc<LogWriterPool>,
    apply: Arc<ApplyPool>,
    sessions: Arc<SessionRegistry>,
    retention: RetentionManager,
    coordinator: Arc<SyncCoordinator>,
    master: ReplMaster,
    applier: Arc<dyn CommandApplier>,
}

impl ReplNode {
    /// Opens the WAL and brings up the pools.
    ///
    /// # Errors
    ///
    /// Returns an error if the WAL cannot be opened.
    pub fn open(
        config: NodeConfig,
        applier: Arc<dyn CommandApplier>,
        snapshots: Arc<dyn SnapshotTransfer>,
    ) -> Result<Self, ReplError> {
        let store = Arc::new(Mutex::new(WalStore::open(config.wal)?));
        let writer = Arc::new(LogWriterPool::new(
            Arc::clone(&store),
            config.writer_lanes,
            config.writer_queue_len,
        ));
        let apply = Arc::new(ApplyPool::new(config.apply_workers));
        let sessions = Arc::new(SessionRegistry::new());
        let retention = RetentionManager::new(
            Arc::clone(&store),
            Arc::clone(&sessions) as Arc<dyn keel_storage::SenderPositions>,
            config.retention,
        );
        let master = ReplMaster::new(
            Arc::clone(&store),
            Arc::clone(&sessions),
            snapshots,
            config.sender_poll_interval,
        );

        Ok(Self {
            store,
            writer,
            apply,
            sessions,
            retention,
            coordinator: Arc::new(SyncCoordinator::new()),
            master,
            applier,
        })
    }

    /// Accepts a local write: appends it to the WAL through the writer pool
    /// and applies it. Rejected on replicas.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::ReadOnly`] on a replica, or the writer pool's
    /// error when the write path is down.
    pub fn submit(&self, argv: &[&[u8]]) -> Result<(), ReplError> {
        if self.coordinator.is_read_only() {
            return Err(ReplError::ReadOnly);
        }
        let key = if argv.len() > 1 { argv[1] } else { argv[0] };
        let frame = encode_command(argv);
        self.writer.submit(key, frame, false)?;

        let owned: Vec<Vec<u8>> = argv.iter().map(|a| a.to_vec()).collect();
        let applier = Arc::clone(&self.applier);
        self.apply.dispatch(key, Box::new(move || applier.apply(&owned)));
        Ok(())
    }

    /// Handles a TRYSYNC request from a replica.
    #[must_use]
    pub fn handle_trysync(&self, argv: &[Vec<u8>]) -> Reply {
        self.master.handle_trysync(argv)
    }

    /// Builds an ingest pipeline for a log stream from this node's master.
    #[must_use]
    pub fn ingest_pipeline(&self) -> IngestPipeline {
        IngestPipeline::new(
            Arc::clone(&self.writer),
            Arc::clone(&self.apply),
            Arc::clone(&self.applier),
        )
    }

    /// Starts following a master. `force` discards the local log position
    /// and resyncs from the start of the master's log.
    ///
    /// # Errors
    ///
    /// Returns an error if the forced log reset fails.
    pub fn replicaof(&self, ip: &str, port: u16, force: bool) -> Result<(), ReplError> {
        if force {
            self.store.lock().set_producer_position(Position::ZERO)?;
        }
        self.coordinator.set_master(ip, port, force);
        Ok(())
    }

    /// Stops following a master and reopens local writes.
    pub fn replicaof_none(&self) {
        self.coordinator.remove_master();
    }

    /// Current producer position of the local WAL.
    #[must_use]
    pub fn producer_position(&self) -> Position {
        self.store.lock().producer_position()
    }

    /// Purges old log files up to the safe boundary.
    ///
    /// # Errors
    ///
    /// Returns an error if file deletion fails.
    pub fn auto_purge(&self) -> Result<usize, ReplError> {
        Ok(self.retention.auto_purge()?)
    }

    /// Operator purge up to `to` (exclusive). Without `force` the bound is
    /// clamped to the safe purge boundary; `force` waives the boundary and
    /// the count/age policy, but never deletes the producer's current file.
    ///
    /// # Errors
    ///
    /// Returns an error if file deletion fails.
    pub fn purge_to(&self, to: u32, force: bool) -> Result<usize, ReplError> {
        Ok(self.retention.purge(to, force)?)
    }

    /// The sync coordinator (replica-side state machine).
    #[must_use]
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// The replica session registry (master-side).
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// The shared WAL store.
    #[must_use]
    pub fn store(&self) -> &Arc<Mutex<WalStore>> {
        &self.store
    }

    /// The log writer pool, for operator error-flag control.
    #[must_use]
    pub fn writer(&self) -> &Arc<LogWriterPool> {
        &self.writer
    }

    /// Stops senders and pools. The WAL stays open until drop.
    pub fn shutdown(&self) {
        info!("node shutting down");
        self.sessions.clear();
        self.writer.shutdown();
        self.apply.shutdown();
    }
}

impl std::fmt::Debug for ReplNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplNode")
            .field("coordinator", &self.coordinator)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}
