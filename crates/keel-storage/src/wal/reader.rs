//! Sequential log readers: single-file scanning and cross-file replay.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

use super::store::WalConfig;
use super::{Position, RECORD_HEADER_SIZE};
use crate::error::WalError;

/// Outcome of reading the next record from the log.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete, checksum-valid record.
    Record {
        /// Position at which the record begins.
        position: Position,
        /// The record payload.
        payload: Vec<u8>,
    },
    /// No more complete records exist yet. A live log may grow past this.
    EndOfLog,
    /// A partial record: the file ends mid-header or mid-payload.
    ///
    /// At the live tail this usually means an append is in flight; during
    /// recovery it marks where a crash interrupted a write.
    TornWrite {
        /// Position of the partial record.
        position: Position,
        /// Description of what was incomplete.
        reason: String,
    },
    /// A record whose payload does not match its stored CRC32.
    ChecksumMismatch {
        /// Position of the corrupted record.
        position: Position,
    },
}

/// What a [`SegmentReader`] found at its cursor.
pub(crate) enum SegmentOutcome {
    Record { offset: u64, payload: Vec<u8> },
    Eof,
    Torn { offset: u64, reason: String },
    Corrupt { offset: u64 },
}

/// Sequential reader over a single log file.
///
/// Reads only up to the file length observed at open (or at the last
/// [`refresh_len`](Self::refresh_len)), so it never consumes a half-flushed
/// record as if it were torn permanently.
pub(crate) struct SegmentReader {
    file_index: u32,
    reader: BufReader<File>,
    offset: u64,
    file_len: u64,
}

impl SegmentReader {
    pub(crate) fn open(path: &Path, file_index: u32, offset: u64) -> Result<Self, WalError> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if offset > file_len {
            return Err(WalError::InvalidPosition {
                file_index,
                offset,
                len: file_len,
            });
        }
        let mut reader = BufReader::new(file);
        if offset > 0 {
            reader.seek(SeekFrom::Start(offset))?;
        }
        Ok(Self {
            file_index,
            reader,
            offset,
            file_len,
        })
    }

    pub(crate) fn file_index(&self) -> u32 {
        self.file_index
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Re-reads the file length. Returns true if the file grew.
    pub(crate) fn refresh_len(&mut self) -> Result<bool, WalError> {
        let len = self.reader.get_ref().metadata()?.len();
        let grew = len > self.file_len;
        self.file_len = len;
        Ok(grew)
    }

    /// Reads the record at the cursor. The cursor advances only when a
    /// complete record is consumed; torn reads leave it in place so the
    /// caller can retry after the file grows.
    pub(crate) fn read_next(&mut self) -> Result<SegmentOutcome, WalError> {
        let start = self.offset;
        let remaining = self.file_len - start;
        if remaining == 0 {
            return Ok(SegmentOutcome::Eof);
        }
        if remaining < RECORD_HEADER_SIZE {
            return Ok(SegmentOutcome::Torn {
                offset: start,
                reason: format!("{remaining} bytes remain, header needs {RECORD_HEADER_SIZE}"),
            });
        }

        let mut header = [0u8; 8];
        self.reader.read_exact(&mut header)?;
        let len = u64::from(u32::from_le_bytes([header[0], header[1], header[2], header[3]]));
        let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if remaining - RECORD_HEADER_SIZE < len {
            // rewind so a retry after the file grows re-reads the header
            self.reader.seek_relative(-8)?;
            return Ok(SegmentOutcome::Torn {
                offset: start,
                reason: format!(
                    "payload needs {len} bytes, {} remain",
                    remaining - RECORD_HEADER_SIZE
                ),
            });
        }

        #[allow(clippy::cast_possible_truncation)] // len came from a u32
        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload)?;

        if crc32c::crc32c(&payload) != stored_crc {
            return Ok(SegmentOutcome::Corrupt { offset: start });
        }

        self.offset = start + RECORD_HEADER_SIZE + len;
        Ok(SegmentOutcome::Record {
            offset: start,
            payload,
        })
    }

    /// Scans forward from the cursor and returns the offset just past the
    /// last valid record. Used at open to find where to truncate a torn tail.
    pub(crate) fn find_valid_end(&mut self) -> Result<u64, WalError> {
        loop {
            match self.read_next()? {
                SegmentOutcome::Record { .. } => {}
                SegmentOutcome::Eof
                | SegmentOutcome::Torn { .. }
                | SegmentOutcome::Corrupt { .. } => return Ok(self.offset),
            }
        }
    }
}

/// Lazy sequential reader across log file boundaries.
///
/// Follows a live log: on end-of-file it re-checks the current file's length
/// and then looks for a successor file, so a replication sender can tail the
/// WAL as the producer rotates. Created via
/// [`WalStore::open_for_replay`](super::WalStore::open_for_replay).
pub struct ReplayReader {
    config: WalConfig,
    segment: SegmentReader,
}

impl ReplayReader {
    pub(crate) fn open(config: WalConfig, from: Position) -> Result<Self, WalError> {
        let path = config.file_path(from.file_index);
        if !path.exists() {
            return Err(WalError::SegmentNotFound {
                file_index: from.file_index,
                dir: config.dir.clone(),
            });
        }
        let segment = SegmentReader::open(&path, from.file_index, from.offset)?;
        Ok(Self { config, segment })
    }

    /// The position the next read will start from.
    #[must_use]
    pub fn position(&self) -> Position {
        Position::new(self.segment.file_index(), self.segment.offset())
    }

    /// Reads the next record, crossing into the successor file when the
    /// current one is exhausted.
    ///
    /// [`ReadOutcome::EndOfLog`] and [`ReadOutcome::TornWrite`] are not
    /// terminal on a live log: the caller may retry after the producer
    /// appends more.
    ///
    /// # Errors
    ///
    /// Returns an error if a file read fails.
    pub fn next_record(&mut self) -> Result<ReadOutcome, WalError> {
        loop {
            match self.segment.read_next()? {
                SegmentOutcome::Record { offset, payload } => {
                    return Ok(ReadOutcome::Record {
                        position: Position::new(self.segment.file_index(), offset),
                        payload,
                    });
                }
                SegmentOutcome::Eof => {
                    if self.segment.refresh_len()? {
                        continue;
                    }
                    let next_index = self.segment.file_index() + 1;
                    let next_path = self.config.file_path(next_index);
                    if next_path.exists() {
                        debug!(file_index = next_index, "replay crossing into next log file");
                        self.segment = SegmentReader::open(&next_path, next_index, 0)?;
                        continue;
                    }
                    return Ok(ReadOutcome::EndOfLog);
                }
                SegmentOutcome::Torn { offset, reason } => {
                    // the append may still be in flight; re-check once
                    if self.segment.refresh_len()? {
                        continue;
                    }
                    return Ok(ReadOutcome::TornWrite {
                        position: Position::new(self.segment.file_index(), offset),
                        reason,
                    });
                }
                SegmentOutcome::Corrupt { offset } => {
                    return Ok(ReadOutcome::ChecksumMismatch {
                        position: Position::new(self.segment.file_index(), offset),
                    });
                }
            }
        }
    }
}

/// Iterates records until end-of-log; torn writes and checksum mismatches
/// surface as errors. Convenient for recovery-style full scans.
impl Iterator for ReplayReader {
    type Item = Result<(Position, Vec<u8>), WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(ReadOutcome::Record { position, payload }) => Some(Ok((position, payload))),
            Ok(ReadOutcome::EndOfLog) => None,
            Ok(ReadOutcome::TornWrite { position, reason }) => Some(Err(WalError::TornWrite {
                file_index: position.file_index,
                offset: position.offset,
                reason,
            })),
            Ok(ReadOutcome::ChecksumMismatch { position }) => {
                Some(Err(WalError::ChecksumMismatch {
                    file_index: position.file_index,
                    offset: position.offset,
                }))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

impl std::fmt::Debug for ReplayReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayReader")
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}
