//! Rotating append-only log file store.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::reader::{ReplayReader, SegmentReader};
use super::{Position, RECORD_HEADER_SIZE};
use crate::error::WalError;

/// Write buffer size for the active log file.
const WRITE_BUF_SIZE: usize = 64 * 1024;

/// Configuration for the WAL store.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the log files.
    pub dir: PathBuf,
    /// File name prefix; files are `<prefix><index:08>`.
    pub file_prefix: String,
    /// Rotate to a new file once the current one would exceed this size.
    pub max_file_size: u64,
    /// Call `fdatasync` after every append (synchronous durability mode).
    pub sync_on_append: bool,
}

impl WalConfig {
    /// Creates a configuration with default rotation settings.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            file_prefix: "wal-".to_string(),
            max_file_size: 100 * 1024 * 1024,
            sync_on_append: false,
        }
    }

    /// Sets the rotation threshold.
    #[must_use]
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    /// Enables or disables `fdatasync` on every append.
    #[must_use]
    pub fn with_sync_on_append(mut self, enabled: bool) -> Self {
        self.sync_on_append = enabled;
        self
    }

    /// Returns the path of the log file with the given index.
    #[must_use]
    pub fn file_path(&self, file_index: u32) -> PathBuf {
        self.dir
            .join(format!("{}{file_index:08}", self.file_prefix))
    }

    /// Parses a file name back into its index, if it matches the prefix.
    fn parse_file_name(&self, name: &str) -> Option<u32> {
        name.strip_prefix(&self.file_prefix)?.parse().ok()
    }
}

/// Rotating append-only record store.
///
/// Sole owner of the producer position. `WalStore` is not internally
/// synchronized: only one physical append may happen at a time across the
/// whole node, so callers share it behind a single `Mutex` (the node-wide
/// append lock). The [`super::LogWriterPool`] is the usual front door.
pub struct WalStore {
    /// Configuration.
    config: WalConfig,
    /// Buffered writer for the active log file.
    writer: BufWriter<fs::File>,
    /// Producer position: where the next record will be appended.
    position: Position,
}

impl WalStore {
    /// Opens the store, resuming at the end of the newest log file.
    ///
    /// Scans the newest file for its last valid record and truncates any torn
    /// tail left by a crash.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or a file cannot
    /// be opened.
    pub fn open(config: WalConfig) -> Result<Self, WalError> {
        fs::create_dir_all(&config.dir)?;

        let files = Self::scan_files(&config)?;
        let (file_index, valid_end) = match files.iter().next_back() {
            None => (0, 0),
            Some((&index, path)) => {
                let mut reader = SegmentReader::open(path, index, 0)?;
                let valid_end = reader.find_valid_end()?;
                if valid_end < reader.file_len() {
                    warn!(
                        file_index = index,
                        valid_end,
                        file_len = reader.file_len(),
                        "truncating torn tail of newest log file"
                    );
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(valid_end)?;
                }
                (index, valid_end)
            }
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.file_path(file_index))?;
        let position = Position::new(file_index, valid_end);
        info!(position = %position, "opened WAL store");

        Ok(Self {
            config,
            writer: BufWriter::with_capacity(WRITE_BUF_SIZE, file),
            position,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Returns the producer position: where the next record will begin.
    #[must_use]
    pub fn producer_position(&self) -> Position {
        self.position
    }

    /// Appends a record, rotating first if the current file would exceed the
    /// size limit. Returns the position at which the record begins.
    ///
    /// Record format: `[length: 4][crc32c: 4][payload: length]`, little-endian.
    /// The record is flushed to the OS before this returns, so a concurrently
    /// running [`ReplayReader`] never observes a position that is not yet
    /// readable.
    ///
    /// # Errors
    ///
    /// Returns an error if any write fails. Append failures are never retried
    /// here; the caller decides what a failed write path means.
    pub fn append(&mut self, record: &[u8]) -> Result<Position, WalError> {
        let framed_len = RECORD_HEADER_SIZE + record.len() as u64;
        if self.position.offset > 0 && self.position.offset + framed_len > self.config.max_file_size
        {
            self.rotate()?;
        }

        let start = self.position;

        #[allow(clippy::cast_possible_truncation)] // record length bounded far below u32::MAX
        let len = record.len() as u32;
        let crc = crc32c::crc32c(record);
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(record)?;
        self.writer.flush()?;
        if self.config.sync_on_append {
            self.writer.get_ref().sync_data()?;
        }

        self.position.offset += framed_len;
        Ok(start)
    }

    /// Syncs the active log file to disk using fdatasync.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Moves the append cursor to an arbitrary position.
    ///
    /// Used during replica bootstrap (`REPLICAOF <addr> force` / resume at a
    /// negotiated offset): creates or truncates the file for
    /// `pos.file_index` so the next append lands exactly at `pos`.
    ///
    /// # Errors
    ///
    /// Returns an error if the target file cannot be created or truncated.
    pub fn set_producer_position(&mut self, pos: Position) -> Result<(), WalError> {
        self.writer.flush()?;

        let path = self.config.file_path(pos.file_index);
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.set_len(pos.offset)?;

        let file = OpenOptions::new().append(true).open(&path)?;
        self.writer = BufWriter::with_capacity(WRITE_BUF_SIZE, file);
        self.position = pos;
        info!(position = %pos, "producer position reset");
        Ok(())
    }

    /// Opens a lazy sequential reader starting at `from`.
    ///
    /// Used by replication senders and by local recovery.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::SegmentNotFound`] if the file holding `from` has
    /// been purged, or [`WalError::InvalidPosition`] if the offset points
    /// past the end of that file.
    pub fn open_for_replay(&self, from: Position) -> Result<ReplayReader, WalError> {
        ReplayReader::open(self.config.clone(), from)
    }

    /// Lists the log files currently on disk, ordered by index.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn files(&self) -> Result<BTreeMap<u32, PathBuf>, WalError> {
        Self::scan_files(&self.config)
    }

    /// Returns the index of the oldest retained log file, if any exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn first_file_index(&self) -> Result<Option<u32>, WalError> {
        Ok(self.files()?.keys().next().copied())
    }

    fn rotate(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;

        let next_index = self.position.file_index + 1;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.config.file_path(next_index))?;
        self.writer = BufWriter::with_capacity(WRITE_BUF_SIZE, file);
        self.position = Position::new(next_index, 0);
        info!(file_index = next_index, "rotated to new log file");
        Ok(())
    }

    fn scan_files(config: &WalConfig) -> Result<BTreeMap<u32, PathBuf>, WalError> {
        let mut files = BTreeMap::new();
        for entry in fs::read_dir(&config.dir)? {
            let entry = entry?;
            if let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(|name| config.parse_file_name(name))
            {
                files.insert(index, entry.path());
            }
        }
        Ok(files)
    }
}

impl std::fmt::Debug for WalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalStore")
            .field("dir", &self.config.dir)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::ReadOutcome;
    use tempfile::TempDir;

    fn small_store(max_file_size: u64) -> (WalStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig::new(temp_dir.path()).with_max_file_size(max_file_size);
        let store = WalStore::open(config).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_open_empty() {
        let (store, _temp_dir) = small_store(1024);
        assert_eq!(store.producer_position(), Position::ZERO);
    }

    #[test]
    fn test_append_monotonicity() {
        let (mut store, _temp_dir) = small_store(64);

        let mut last = None;
        for i in 0..50u32 {
            let pos = store.append(format!("record-{i}").as_bytes()).unwrap();
            if let Some(prev) = last {
                assert!(pos > prev, "positions must be strictly increasing");
            }
            last = Some(pos);
        }
        // 64-byte files force several rotations
        assert!(store.producer_position().file_index > 0);
    }

    #[test]
    fn test_replay_fidelity_across_rotation() {
        let (mut store, _temp_dir) = small_store(48);

        let records: Vec<Vec<u8>> = (0..20).map(|i| format!("payload-{i}").into_bytes()).collect();
        for record in &records {
            store.append(record).unwrap();
        }

        let reader = store.open_for_replay(Position::ZERO).unwrap();
        let replayed: Vec<Vec<u8>> = reader
            .map(|r| r.map(|(_, payload)| payload))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(replayed, records);
    }

    #[test]
    fn test_rotation_at_size_limit() {
        let (mut store, _temp_dir) = small_store(40);

        store.append(&[0u8; 24]).unwrap(); // 32 framed bytes in file 0
        assert_eq!(store.producer_position().file_index, 0);
        store.append(&[1u8; 24]).unwrap(); // would exceed 40, rotates
        assert_eq!(store.producer_position().file_index, 1);
    }

    #[test]
    fn test_oversized_record_still_appends() {
        // a single record larger than the limit gets a file of its own
        let (mut store, _temp_dir) = small_store(16);
        let pos = store.append(&[7u8; 64]).unwrap();
        assert_eq!(pos.offset, 0);
    }

    #[test]
    fn test_reopen_resumes_position() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig::new(temp_dir.path());

        let end = {
            let mut store = WalStore::open(config.clone()).unwrap();
            store.append(b"one").unwrap();
            store.append(b"two").unwrap();
            store.producer_position()
        };

        let store = WalStore::open(config).unwrap();
        assert_eq!(store.producer_position(), end);
    }

    #[test]
    fn test_torn_tail_truncated_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig::new(temp_dir.path());

        let end = {
            let mut store = WalStore::open(config.clone()).unwrap();
            store.append(b"intact").unwrap();
            store.producer_position()
        };

        // simulate a crash mid-append
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(config.file_path(0))
                .unwrap();
            file.write_all(&[0xFF, 0xFF, 0xFF]).unwrap();
        }

        let mut store = WalStore::open(config).unwrap();
        assert_eq!(store.producer_position(), end);

        // and the log is still appendable and fully replayable
        store.append(b"after-recovery").unwrap();
        let reader = store.open_for_replay(Position::ZERO).unwrap();
        let replayed: Vec<Vec<u8>> = reader
            .map(|r| r.map(|(_, payload)| payload))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(replayed, vec![b"intact".to_vec(), b"after-recovery".to_vec()]);
    }

    #[test]
    fn test_set_producer_position() {
        let (mut store, _temp_dir) = small_store(1024);
        store.append(b"before").unwrap();

        store
            .set_producer_position(Position::new(5, 0))
            .unwrap();
        assert_eq!(store.producer_position(), Position::new(5, 0));

        let pos = store.append(b"after").unwrap();
        assert_eq!(pos, Position::new(5, 0));
    }

    #[test]
    fn test_replay_from_purged_file_fails() {
        let (mut store, _temp_dir) = small_store(32);
        for i in 0..10u8 {
            store.append(&[i; 20]).unwrap();
        }
        // purge file 0 out from under the reader
        let files = store.files().unwrap();
        fs::remove_file(&files[&0]).unwrap();

        let err = store.open_for_replay(Position::ZERO).unwrap_err();
        assert!(matches!(err, WalError::SegmentNotFound { file_index: 0, .. }));
    }

    #[test]
    fn test_replay_from_bad_offset_fails() {
        let (mut store, _temp_dir) = small_store(1024);
        store.append(b"short").unwrap();

        let err = store
            .open_for_replay(Position::new(0, 10_000))
            .unwrap_err();
        assert!(matches!(err, WalError::InvalidPosition { .. }));
    }

    #[test]
    fn test_reader_sees_records_appended_after_open() {
        let (mut store, _temp_dir) = small_store(1024);
        store.append(b"first").unwrap();

        let mut reader = store.open_for_replay(Position::ZERO).unwrap();
        match reader.next_record().unwrap() {
            ReadOutcome::Record { payload, .. } => assert_eq!(payload, b"first"),
            other => panic!("expected record, got {other:?}"),
        }
        assert!(matches!(
            reader.next_record().unwrap(),
            ReadOutcome::EndOfLog
        ));

        store.append(b"second").unwrap();
        match reader.next_record().unwrap() {
            ReadOutcome::Record { payload, .. } => assert_eq!(payload, b"second"),
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn test_files_listing() {
        let (mut store, _temp_dir) = small_store(32);
        for i in 0..8u8 {
            store.append(&[i; 20]).unwrap();
        }
        let files = store.files().unwrap();
        assert!(files.len() > 1);
        assert_eq!(store.first_file_index().unwrap(), Some(0));
        assert!(files.contains_key(&store.producer_position().file_index));
    }
}
