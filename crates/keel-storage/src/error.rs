//! Error types for WAL operations.

use std::path::PathBuf;

/// Errors that can occur in WAL operations.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// IO error during WAL operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Log file not found (purged or never written).
    #[error("log file {file_index} not found under {dir}")]
    SegmentNotFound {
        /// Index of the missing file.
        file_index: u32,
        /// Directory that was searched.
        dir: PathBuf,
    },

    /// A position pointed past the end of its log file.
    #[error("offset {offset} is past the end of log file {file_index} (len {len})")]
    InvalidPosition {
        /// Index of the file.
        file_index: u32,
        /// Requested byte offset.
        offset: u64,
        /// Actual file length.
        len: u64,
    },

    /// CRC32 checksum mismatch.
    #[error("CRC32 checksum mismatch in log file {file_index} at offset {offset}")]
    ChecksumMismatch {
        /// Index of the file holding the corrupted record.
        file_index: u32,
        /// Offset of the corrupted record.
        offset: u64,
    },

    /// Torn write detected (partial record at end of a log file).
    #[error("torn write in log file {file_index} at offset {offset}: {reason}")]
    TornWrite {
        /// Index of the file holding the partial record.
        file_index: u32,
        /// Offset where the torn write was detected.
        offset: u64,
        /// Description of what was incomplete.
        reason: String,
    },

    /// The write path has been disabled by an earlier append failure.
    ///
    /// Cleared only by operator action (`LogWriterPool::set_io_error`).
    #[error("replication log write failed: write path disabled by an earlier IO error")]
    WritePathDisabled,

    /// The writer pool is stopped; the submission was not accepted.
    #[error("log writer pool is stopped")]
    Stopped,
}
