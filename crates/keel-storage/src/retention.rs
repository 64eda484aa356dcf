//! Log retention: the safe purge boundary and purge execution.
//!
//! Old log files can be deleted once no replication sender still needs them.
//! The boundary is derived from the senders' read positions with a safety
//! margin subtracted, so a sender that is between files or briefly behind on
//! reporting never loses the file under its cursor.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::WalError;
use crate::wal::WalStore;

/// Source of replication sender read positions.
///
/// Implemented by the replication session registry; injected here so the
/// storage layer never depends on the replication layer.
pub trait SenderPositions: Send + Sync {
    /// The file index each live sender is currently reading, or `None` if
    /// any sender has not reported a position yet. `None` forbids purging.
    fn sender_file_indexes(&self) -> Option<Vec<u32>>;
}

/// Retention policy knobs.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Minimum number of log files to keep regardless of age.
    pub keep_files: u32,
    /// Delete files older than this many days (0 disables age-based purge).
    pub expire_days: u32,
    /// Files held back behind the slowest sender, as slack for senders that
    /// are mid-handoff between files.
    pub safety_margin: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_files: 10,
            expire_days: 7,
            safety_margin: 10,
        }
    }
}

/// Computes purge boundaries and deletes expired log files.
///
/// Purges are single-flight: a second request while one is running is
/// refused rather than queued.
pub struct RetentionManager {
    store: Arc<Mutex<WalStore>>,
    senders: Arc<dyn SenderPositions>,
    config: RetentionConfig,
    purging: AtomicBool,
}

impl RetentionManager {
    /// Creates a manager over `store`, consulting `senders` for the
    /// replication floor.
    #[must_use]
    pub fn new(
        store: Arc<Mutex<WalStore>>,
        senders: Arc<dyn SenderPositions>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            store,
            senders,
            config,
            purging: AtomicBool::new(false),
        }
    }

    /// Highest file index that may be deleted (exclusive): the slowest
    /// sender's file minus the safety margin. `None` when nothing may be
    /// purged, either because a sender is unreported or because the slowest
    /// sender is within the margin of the start of the log.
    #[must_use]
    pub fn safe_purge_boundary(&self) -> Option<u32> {
        let indexes = self.senders.sender_file_indexes()?;
        let slowest = indexes.iter().min().copied().unwrap_or_else(|| {
            // no senders at all: bounded by the producer instead
            self.store.lock().producer_position().file_index
        });
        slowest.checked_sub(self.config.safety_margin)
    }

    /// Deletes log files with index below `to` (exclusive), subject to the
    /// retention policy.
    ///
    /// Without `force` the bound is first clamped to the safe purge
    /// boundary, so files a sender still needs (or any file, while a sender
    /// is unreported) survive no matter what `to` says. Also skipped (in
    /// index order, stopping at the first file kept) are files that would
    /// drop the retained count below `keep_files` and files younger than
    /// `expire_days`. `force` waives the boundary, count, and age checks;
    /// nothing ever deletes the producer's current file.
    ///
    /// Returns the number of files deleted, or `Ok(0)` if a purge is already
    /// running.
    ///
    /// # Errors
    ///
    /// Returns an error if listing or deleting files fails. A failed delete
    /// stops the purge at that file; earlier deletions stand.
    pub fn purge(&self, to: u32, force: bool) -> Result<usize, WalError> {
        if self.purging.swap(true, Ordering::AcqRel) {
            warn!("purge already in progress, skipping");
            return Ok(0);
        }
        let result = self.purge_inner(to, force);
        self.purging.store(false, Ordering::Release);
        result
    }

    /// Runs an automatic purge up to the safe boundary, applying the policy.
    /// No-op when the boundary forbids purging.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`purge`](Self::purge).
    pub fn auto_purge(&self) -> Result<usize, WalError> {
        match self.safe_purge_boundary() {
            Some(to) if to > 0 => self.purge(to, false),
            _ => Ok(0),
        }
    }

    fn purge_inner(&self, to: u32, force: bool) -> Result<usize, WalError> {
        let to = if force {
            to
        } else {
            match self.safe_purge_boundary() {
                Some(boundary) => to.min(boundary),
                None => {
                    warn!("purge refused: a sender has not reported its position");
                    return Ok(0);
                }
            }
        };

        let store = self.store.lock();
        let files = store.files()?;
        let producer_index = store.producer_position().file_index;
        drop(store);

        let total = u32::try_from(files.len()).unwrap_or(u32::MAX);
        let expire_before = expiry_cutoff(self.config.expire_days);

        let mut deleted = 0u32;
        for (&index, path) in &files {
            if index >= to || index >= producer_index {
                break;
            }
            if !force {
                if total - deleted <= self.config.keep_files {
                    break;
                }
                if let Some(cutoff) = expire_before {
                    let modified = fs::metadata(path)?.modified()?;
                    if modified > cutoff {
                        // newest-first from here on; nothing older remains
                        break;
                    }
                }
            }
            fs::remove_file(path)?;
            deleted += 1;
        }

        if deleted > 0 {
            info!(deleted, to, force, "purged log files");
        }
        Ok(deleted as usize)
    }
}

impl std::fmt::Debug for RetentionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn expiry_cutoff(expire_days: u32) -> Option<SystemTime> {
    if expire_days == 0 {
        return None;
    }
    SystemTime::now().checked_sub(Duration::from_secs(u64::from(expire_days) * 24 * 3600))
}
