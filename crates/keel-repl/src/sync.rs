//! Master-side TRYSYNC handling.
//!
//! A replica asks to stream the log from a position it already holds. The
//! master validates the position against its own log and either starts a
//! sender at that position, or tells the replica to take a full snapshot
//! when the requested range is gone.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use keel_storage::{Position, WalError, WalStore};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::ReplError;
use crate::protocol::Reply;
use crate::sender;
use crate::session::SessionRegistry;
use crate::LOG_STREAM_PORT_OFFSET;

/// Hook for kicking off a full snapshot transfer to a replica.
///
/// Invoked when a TRYSYNC asks for a log range that has been purged. The
/// transfer itself runs out of band; the replica re-handshakes once it has
/// loaded the snapshot.
pub trait SnapshotTransfer: Send + Sync {
    /// Starts (or joins an in-flight) snapshot transfer to `replica_addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer cannot be started.
    fn begin_snapshot(&self, replica_addr: &str) -> Result<(), ReplError>;
}

/// Master-side replication entry point: owns handshake handling and sender
/// spawning for this node's replicas.
pub struct ReplMaster {
    store: Arc<Mutex<WalStore>>,
    sessions: Arc<SessionRegistry>,
    snapshots: Arc<dyn SnapshotTransfer>,
    sender_poll_interval: Duration,
}

impl ReplMaster {
    /// Creates the master over its WAL, session registry, and snapshot hook.
    #[must_use]
    pub fn new(
        store: Arc<Mutex<WalStore>>,
        sessions: Arc<SessionRegistry>,
        snapshots: Arc<dyn SnapshotTransfer>,
        sender_poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            sessions,
            snapshots,
            sender_poll_interval,
        }
    }

    /// The session registry backing this master.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Handles a `trysync <ip> <port> <file_index> <offset>` request.
    ///
    /// Replies:
    /// - `:sid` and a sender starts streaming from the requested position
    /// - `+wait-snapshot` when the range was purged; a snapshot transfer to
    ///   the replica has been triggered
    /// - `-ERR ...` for positions ahead of the log, duplicate sessions, or
    ///   malformed requests
    #[must_use]
    pub fn handle_trysync(&self, argv: &[Vec<u8>]) -> Reply {
        let (ip, port, requested) = match parse_trysync(argv) {
            Ok(parsed) => parsed,
            Err(e) => return Reply::Err(e.to_string()),
        };
        let replica_addr = format!("{ip}:{port}");

        let producer = self.store.lock().producer_position();
        if requested > producer {
            let err = ReplError::InvalidOffset { requested, producer };
            warn!(replica_addr, %err, "trysync ahead of log");
            return Reply::Err(err.to_string());
        }

        let sid = match self.sessions.register(&replica_addr) {
            Ok(sid) => sid,
            Err(e) => return Reply::Err(e.to_string()),
        };

        match self.start_sender(&replica_addr, ip, port, requested) {
            Ok(()) => {
                info!(replica_addr, sid, from = %requested, "incremental sync accepted");
                Reply::SessionId(sid)
            }
            Err(ReplError::Incomplete) => {
                self.sessions.remove(&replica_addr);
                info!(replica_addr, from = %requested, "requested log purged, offering snapshot");
                if let Err(e) = self.snapshots.begin_snapshot(&replica_addr) {
                    warn!(replica_addr, error = %e, "snapshot transfer failed to start");
                    return Reply::Err(e.to_string());
                }
                Reply::WaitSnapshot
            }
            Err(e) => {
                self.sessions.remove(&replica_addr);
                warn!(replica_addr, error = %e, "trysync rejected");
                Reply::Err(e.to_string())
            }
        }
    }

    fn start_sender(
        &self,
        replica_addr: &str,
        ip: &str,
        port: u16,
        from: Position,
    ) -> Result<(), ReplError> {
        let reader = self
            .store
            .lock()
            .open_for_replay(from)
            .map_err(|e| match e {
                WalError::SegmentNotFound { .. } => ReplError::Incomplete,
                other => ReplError::Wal(other),
            })?;
        let stream = TcpStream::connect((ip, port + LOG_STREAM_PORT_OFFSET))?;

        let registry = Arc::clone(&self.sessions);
        let exit_addr = replica_addr.to_string();
        let handle = sender::spawn(
            reader,
            stream,
            replica_addr.to_string(),
            self.sender_poll_interval,
            Box::new(move || registry.remove(&exit_addr)),
        )?;
        self.sessions.attach_sender(replica_addr, handle);
        Ok(())
    }
}

impl std::fmt::Debug for ReplMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplMaster")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

fn parse_trysync(argv: &[Vec<u8>]) -> Result<(&str, u16, Position), ReplError> {
    if argv.len() != 5 || !argv[0].eq_ignore_ascii_case(b"trysync") {
        return Err(ReplError::Protocol("expected trysync <ip> <port> <file_index> <offset>".to_string()));
    }
    let text = |i: usize| {
        std::str::from_utf8(&argv[i])
            .map_err(|_| ReplError::Protocol(format!("argument {i} is not UTF-8")))
    };
    let ip = text(1)?;
    let port = text(2)?
        .parse()
        .map_err(|_| ReplError::Protocol("bad port".to_string()))?;
    let file_index = text(3)?
        .parse()
        .map_err(|_| ReplError::Protocol("bad file index".to_string()))?;
    let offset = text(4)?
        .parse()
        .map_err(|_| ReplError::Protocol("bad offset".to_string()))?;
    Ok((ip, port, Position::new(file_index, offset)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_storage::WalConfig;
    use parking_lot::Mutex as PlMutex;
    use std::io::Read;
    use std::net::TcpListener;
    use tempfile::TempDir;

    struct RecordingSnapshots(PlMutex<Vec<String>>);

    impl SnapshotTransfer for RecordingSnapshots {
        fn begin_snapshot(&self, replica_addr: &str) -> Result<(), ReplError> {
            self.0.lock().push(replica_addr.to_string());
            Ok(())
        }
    }

    struct Fixture {
        master: ReplMaster,
        store: Arc<Mutex<WalStore>>,
        snapshots: Arc<RecordingSnapshots>,
        _temp_dir: TempDir,
    }

    fn fixture(max_file_size: u64) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig::new(temp_dir.path()).with_max_file_size(max_file_size);
        let store = Arc::new(Mutex::new(WalStore::open(config).unwrap()));
        let snapshots = Arc::new(RecordingSnapshots(PlMutex::new(Vec::new())));
        let master = ReplMaster::new(
            Arc::clone(&store),
            Arc::new(SessionRegistry::new()),
            Arc::clone(&snapshots) as Arc<dyn SnapshotTransfer>,
            Duration::from_millis(5),
        );
        Fixture {
            master,
            store,
            snapshots,
            _temp_dir: temp_dir,
        }
    }

    fn trysync_argv(port: u16, file_index: u32, offset: u64) -> Vec<Vec<u8>> {
        vec![
            b"trysync".to_vec(),
            b"127.0.0.1".to_vec(),
            port.to_string().into_bytes(),
            file_index.to_string().into_bytes(),
            offset.to_string().into_bytes(),
        ]
    }

    #[test]
    fn test_trysync_streams_from_requested_position() {
        let fx = fixture(1024);
        fx.store.lock().append(b"old").unwrap();
        let resume = fx.store.lock().producer_position();
        fx.store.lock().append(b"new-record").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let replica_port = listener.local_addr().unwrap().port() - LOG_STREAM_PORT_OFFSET;

        let reply = fx
            .master
            .handle_trysync(&trysync_argv(replica_port, resume.file_index, resume.offset));
        assert!(matches!(reply, Reply::SessionId(_)));

        let (mut conn, _) = listener.accept().unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = vec![0u8; 10];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(buf, b"new-record");

        fx.master.sessions().clear();
    }

    #[test]
    fn test_trysync_ahead_of_log_rejected() {
        let fx = fixture(1024);
        fx.store.lock().append(b"x").unwrap();
        let producer = fx.store.lock().producer_position();

        let reply = fx.master.handle_trysync(&trysync_argv(40000, 3, 0));
        let expected = ReplError::InvalidOffset {
            requested: Position::new(3, 0),
            producer,
        };
        assert_eq!(reply, Reply::Err(expected.to_string()));
        assert!(fx.master.sessions().is_empty());
    }

    #[test]
    fn test_trysync_past_end_of_file_rejected() {
        let fx = fixture(1024);
        fx.store.lock().append(&[0u8; 100]).unwrap();

        // within the producer file but past its durable length on disk is
        // impossible; aim past a completed earlier file instead
        let reply = fx.master.handle_trysync(&trysync_argv(40000, 0, 99_999));
        assert!(matches!(reply, Reply::Err(_)));
    }

    #[test]
    fn test_trysync_at_purged_file_offers_snapshot() {
        let fx = fixture(32);
        for i in 0..10u8 {
            fx.store.lock().append(&[i; 20]).unwrap();
        }
        let file_0 = fx.store.lock().files().unwrap()[&0].clone();
        std::fs::remove_file(file_0).unwrap();

        let reply = fx.master.handle_trysync(&trysync_argv(40000, 0, 0));
        assert!(matches!(reply, Reply::WaitSnapshot));
        assert_eq!(*fx.snapshots.0.lock(), vec!["127.0.0.1:40000".to_string()]);
        // the failed session does not linger
        assert!(fx.master.sessions().is_empty());
    }

    #[test]
    fn test_duplicate_session_rejected() {
        let fx = fixture(1024);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let replica_port = listener.local_addr().unwrap().port() - LOG_STREAM_PORT_OFFSET;

        let first = fx.master.handle_trysync(&trysync_argv(replica_port, 0, 0));
        assert!(matches!(first, Reply::SessionId(_)));
        let second = fx.master.handle_trysync(&trysync_argv(replica_port, 0, 0));
        assert!(matches!(second, Reply::Err(_)));

        fx.master.sessions().clear();
    }

    #[test]
    fn test_malformed_trysync_rejected() {
        let fx = fixture(1024);
        let reply = fx.master.handle_trysync(&[b"trysync".to_vec()]);
        assert!(matches!(reply, Reply::Err(_)));
    }
}
