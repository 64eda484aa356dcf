//! # KeelDB Storage
//!
//! Durability layer for KeelDB - the rotating write-ahead log, the partitioned
//! log writer pool in front of it, and log retention.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Write-ahead log implementation - rotating files, replay, writer lanes
pub mod wal;

/// Log retention - safe purge boundary and purge policies
pub mod retention;

mod error;

// Re-export key types
pub use error::WalError;
pub use retention::{RetentionConfig, RetentionManager, SenderPositions};
pub use wal::{LogWriterPool, Position, ReadOutcome, ReplayReader, WalConfig, WalStore};
