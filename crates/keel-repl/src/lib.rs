//! # KeelDB Replication
//!
//! Master/replica replication over the write-ahead log: the TRYSYNC
//! handshake, per-replica log senders, the replica-side ingest pipeline with
//! its sequence barrier, the key-partitioned apply pool, and the sync
//! coordinator state machine.
//!
//! ## Topology
//!
//! ```text
//!   master                                   replica
//!   ───────                                  ────────
//!   control listener (port)      ◄── TRYSYNC ── sync coordinator
//!   heartbeat listener (+2000)   ◄── ping ───── heartbeat prober
//!   log sender ── records ──►  ingest listener (+1000)
//!   snapshot sender (+3000) ──►  snapshot receiver
//! ```
//!
//! The master appends every accepted write to its WAL and streams the raw
//! records to each replica. A replica feeds the stream through a
//! [`IngestPipeline`]: records are decoded, given a sequence number, appended
//! to the replica's own WAL in arrival order (enforced by the
//! [`SequenceBarrier`]), and applied on the key-partitioned [`ApplyPool`].

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Key-partitioned apply worker pool
pub mod apply;

/// Sequence barrier for arrival-order WAL appends
pub mod barrier;

/// Incremental wire decoder
pub mod decoder;

/// Replication heartbeat - prober and responder
pub mod heartbeat;

/// Replica-side ingest pipeline
pub mod ingest;

/// Node facade tying storage and replication together
pub mod node;

/// Wire protocol - command encoding and handshake replies
pub mod protocol;

/// Replica session registry on the master
pub mod session;

/// Per-replica log sender
pub mod sender;

/// Replica-side sync coordinator state machine
pub mod state;

/// Master-side TRYSYNC handling
pub mod sync;

mod error;

pub use apply::ApplyPool;
pub use barrier::SequenceBarrier;
pub use decoder::{DecodedRecord, StreamDecoder};
pub use error::ReplError;
pub use ingest::IngestPipeline;
pub use node::{CommandApplier, NodeConfig, ReplNode};
pub use protocol::Reply;
pub use session::{SessionRegistry, SessionStage};
pub use state::{ReplState, SyncCoordinator};
pub use sync::{ReplMaster, SnapshotTransfer};

/// Port offset of the replica's log-stream listener.
pub const LOG_STREAM_PORT_OFFSET: u16 = 1000;
/// Port offset of the master's heartbeat listener.
pub const HEARTBEAT_PORT_OFFSET: u16 = 2000;
/// Port offset of the snapshot transfer listener.
pub const SNAPSHOT_PORT_OFFSET: u16 = 3000;
