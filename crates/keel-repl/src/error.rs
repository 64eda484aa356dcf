//! Error types for replication operations.

use keel_storage::Position;

/// Errors that can occur in replication operations.
#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    /// IO error on a replication link.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the storage layer.
    #[error(transparent)]
    Wal(#[from] keel_storage::WalError),

    /// A replica requested a resync position ahead of the master's log.
    #[error("invalid resync offset {requested}: producer is at {producer}")]
    InvalidOffset {
        /// Position the replica asked for.
        requested: Position,
        /// The master's current producer position.
        producer: Position,
    },

    /// The requested log range has been purged; a full snapshot is needed.
    #[error("requested log range no longer retained, snapshot required")]
    Incomplete,

    /// A session for this replica address already exists.
    #[error("replication session for {addr} already exists")]
    SessionExists {
        /// Address of the replica.
        addr: String,
    },

    /// The replication link dropped.
    #[error("replication link disconnected")]
    Disconnected,

    /// A handshake or heartbeat step timed out.
    #[error("timed out during {during}")]
    Timeout {
        /// The step that timed out.
        during: String,
    },

    /// Malformed data on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Write rejected because this node is a read-only replica.
    #[error("node is a read-only replica")]
    ReadOnly,
}
