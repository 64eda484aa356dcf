//! Wire protocol for replication.
//!
//! Commands travel as multibulk frames, `*N\r\n` followed by N bulk strings
//! `$len\r\n<bytes>\r\n`. The same framing is what gets appended to the WAL,
//! so a log sender can stream stored records verbatim. Handshake and
//! heartbeat replies are single lines: `:n` (integer), `+text` (status),
//! `-ERR text` (error).

use std::io::{BufRead, Write};

use crate::error::ReplError;

/// Status line a master sends when the replica must take a full snapshot
/// before log streaming can start.
pub const WAIT_SNAPSHOT: &str = "wait-snapshot";

/// A single-line reply on the control or heartbeat connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `:n` - the session id assigned by the master.
    SessionId(u64),
    /// `+wait-snapshot` - resync refused, snapshot transfer starting.
    WaitSnapshot,
    /// `+text` - other status line (heartbeat pongs).
    Status(String),
    /// `-ERR text` - the request was rejected.
    Err(String),
}

/// Encodes an argument vector as a multibulk frame.
#[must_use]
pub fn encode_command(argv: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + argv.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", argv.len()).as_bytes());
    for arg in argv {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Writes a reply line to a stream.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn write_reply<W: Write>(writer: &mut W, reply: &Reply) -> Result<(), ReplError> {
    let line = match reply {
        Reply::SessionId(sid) => format!(":{sid}\r\n"),
        Reply::WaitSnapshot => format!("+{WAIT_SNAPSHOT}\r\n"),
        Reply::Status(text) => format!("+{text}\r\n"),
        Reply::Err(text) => format!("-ERR {text}\r\n"),
    };
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Reads one reply line from a buffered stream.
///
/// # Errors
///
/// Returns [`ReplError::Disconnected`] on a clean close and
/// [`ReplError::Protocol`] on a malformed line.
pub fn read_reply<R: BufRead>(reader: &mut R) -> Result<Reply, ReplError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(ReplError::Disconnected);
    }
    let line = line.trim_end_matches(['\r', '\n']);
    match line.as_bytes().first() {
        Some(b':') => line[1..]
            .parse()
            .map(Reply::SessionId)
            .map_err(|_| ReplError::Protocol(format!("bad session id line: {line:?}"))),
        Some(b'+') if &line[1..] == WAIT_SNAPSHOT => Ok(Reply::WaitSnapshot),
        Some(b'+') => Ok(Reply::Status(line[1..].to_string())),
        Some(b'-') => Ok(Reply::Err(
            line[1..].trim_start_matches("ERR ").to_string(),
        )),
        _ => Err(ReplError::Protocol(format!("bad reply line: {line:?}"))),
    }
}

/// Builds the TRYSYNC command a replica sends to request log streaming from
/// `(file_index, offset)`.
#[must_use]
pub fn trysync_command(replica_ip: &str, replica_port: u16, file_index: u32, offset: u64) -> Vec<u8> {
    let port = replica_port.to_string();
    let file_index = file_index.to_string();
    let offset = offset.to_string();
    encode_command(&[
        b"trysync",
        replica_ip.as_bytes(),
        port.as_bytes(),
        file_index.as_bytes(),
        offset.as_bytes(),
    ])
}
