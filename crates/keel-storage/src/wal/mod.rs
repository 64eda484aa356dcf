//! # Write-Ahead Log
//!
//! Rotating append-only log files plus the partitioned writer pool in front of
//! them. Every mutation accepted by the node is appended here before it is
//! applied to the data store.
//!
//! ## Architecture
//!
//! ```text
//!  submitters (command layer / replication ingest)
//!        │ submit(partition_key, record, synchronous)
//!        ▼
//!  ┌───────────────────────────────────────────┐
//!  │ LogWriterPool                             │
//!  │  lane 0   lane 1   ...   lane N-1         │
//!  │  (bounded queue + drain thread each)      │
//!  └───────────────┬───────────────────────────┘
//!                  │ single append lock
//!                  ▼
//!          ┌──────────────┐
//!          │   WalStore   │  wal-00000000, wal-00000001, ...
//!          └──────────────┘
//! ```
//!
//! ## Key Components
//!
//! - [`WalStore`]: rotating file store, sole owner of the producer position
//! - [`LogWriterPool`]: partitioned submission surface with backpressure
//! - [`ReplayReader`]: lazy sequential reader across file boundaries
//! - [`Position`]: `(file_index, byte_offset)` producer cursor
//!
//! ## Ordering
//!
//! Submission order equals append order *within a lane*. Two submissions with
//! different partition keys may land in the WAL in either order; callers that
//! need a total append order must serialize their submissions themselves (the
//! replication ingest pipeline does, via its sequence barrier).

mod position;
mod reader;
mod store;
mod writer_pool;

pub use position::Position;
pub use reader::{ReadOutcome, ReplayReader};
pub use store::{WalConfig, WalStore};
pub use writer_pool::LogWriterPool;

/// Size of the record header (length + CRC32).
pub(crate) const RECORD_HEADER_SIZE: u64 = 8;
