//! Incremental multibulk decoder for the replication stream.
//!
//! The log stream is a concatenation of multibulk frames with no outer
//! framing, so the decoder must cope with frames split at arbitrary byte
//! boundaries. Bytes accumulate in a [`bytes::BytesMut`]; a frame is consumed
//! from the buffer only once it is complete.

use bytes::{Buf, BytesMut};

use crate::error::ReplError;
use crate::protocol::encode_command;

/// Upper bound on a single argument, to catch garbage lengths early.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// One fully decoded command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    /// The decoded argument vector.
    pub argv: Vec<Vec<u8>>,
    /// Canonical re-encoding of `argv`, suitable for appending to the WAL.
    pub raw: Vec<u8>,
}

impl DecodedRecord {
    /// The key this record partitions on: the first argument after the
    /// command name, or the command name itself for keyless commands.
    #[must_use]
    pub fn partition_key(&self) -> &[u8] {
        self.argv.get(1).unwrap_or(&self.argv[0])
    }
}

/// Incremental decoder over a growable byte buffer.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buf: BytesMut,
}

impl StreamDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly received bytes to the buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed by a complete frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Tries to decode the next complete frame.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial frame; feed
    /// more bytes and try again. A complete frame is consumed from the
    /// buffer before it is returned, a partial one is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Protocol`] on malformed input. The decoder is
    /// not usable after a protocol error; the connection should be dropped.
    pub fn next(&mut self) -> Result<Option<DecodedRecord>, ReplError> {
        let mut cursor = 0usize;

        let Some(argc) = self.parse_prefixed_int(&mut cursor, b'*')? else {
            return Ok(None);
        };
        if argc == 0 {
            return Err(ReplError::Protocol("empty multibulk frame".to_string()));
        }

        let mut argv = Vec::with_capacity(argc);
        for _ in 0..argc {
            let Some(len) = self.parse_prefixed_int(&mut cursor, b'$')? else {
                return Ok(None);
            };
            if len > MAX_BULK_LEN {
                return Err(ReplError::Protocol(format!("bulk length {len} too large")));
            }
            if self.buf.len() < cursor + len + 2 {
                return Ok(None);
            }
            argv.push(self.buf[cursor..cursor + len].to_vec());
            if &self.buf[cursor + len..cursor + len + 2] != b"\r\n" {
                return Err(ReplError::Protocol("bulk not CRLF-terminated".to_string()));
            }
            cursor += len + 2;
        }

        self.buf.advance(cursor);
        let raw = encode_command(&argv.iter().map(Vec::as_slice).collect::<Vec<_>>());
        Ok(Some(DecodedRecord { argv, raw }))
    }

    /// Parses `<marker><digits>\r\n` at `*cursor`, advancing it past the
    /// line. `Ok(None)` means the line is not complete yet.
    fn parse_prefixed_int(
        &self,
        cursor: &mut usize,
        marker: u8,
    ) -> Result<Option<usize>, ReplError> {
        let rest = &self.buf[*cursor..];
        if rest.is_empty() {
            return Ok(None);
        }
        if rest[0] != marker {
            return Err(ReplError::Protocol(format!(
                "expected {:?}, found {:?}",
                char::from(marker),
                char::from(rest[0])
            )));
        }
        let Some(line_end) = rest.windows(2).position(|w| w == b"\r\n") else {
            return Ok(None);
        };
        let digits = &rest[1..line_end];
        let value = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ReplError::Protocol("bad length line".to_string()))?;
        *cursor += line_end + 2;
        Ok(Some(value))
    }
}
