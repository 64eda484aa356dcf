//! Network front end: control, heartbeat, and replica-side loops.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keel_repl::{
    heartbeat, protocol, ReplError, ReplNode, Reply, SnapshotTransfer, StreamDecoder,
    HEARTBEAT_PORT_OFFSET, LOG_STREAM_PORT_OFFSET,
};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::kv::KvStore;

/// Snapshot hook for the control listener.
///
/// The transfer protocol itself (port +3000) is not wired up here; replicas
/// told to wait are expected to be re-seeded out of band and handshake
/// again.
pub struct SnapshotStub;

impl SnapshotTransfer for SnapshotStub {
    fn begin_snapshot(&self, replica_addr: &str) -> Result<(), ReplError> {
        warn!(replica_addr, "snapshot requested; seed the replica out of band");
        Ok(())
    }
}

/// Everything the connection handlers share.
pub struct Server {
    pub node: Arc<ReplNode>,
    pub kv: Arc<KvStore>,
    pub config: ServerConfig,
    pub shutdown: AtomicBool,
}

impl Server {
    /// Spawns the listener and background threads. Returns their handles.
    ///
    /// # Errors
    ///
    /// Returns an error if a listener port cannot be bound.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<Vec<thread::JoinHandle<()>>> {
        let mut handles = Vec::new();

        let control = TcpListener::bind((self.config.ip.as_str(), self.config.port))?;
        info!(addr = %control.local_addr()?, "control listener up");
        let server = Arc::clone(self);
        handles.push(thread::Builder::new().name("control".into()).spawn(move || {
            server.accept_control(&control);
        })?);

        let hb_port = self.config.port + HEARTBEAT_PORT_OFFSET;
        let heartbeat = TcpListener::bind((self.config.ip.as_str(), hb_port))?;
        info!(addr = %heartbeat.local_addr()?, "heartbeat listener up");
        let server = Arc::clone(self);
        handles.push(thread::Builder::new().name("heartbeat".into()).spawn(move || {
            server.accept_heartbeat(&heartbeat);
        })?);

        let server = Arc::clone(self);
        handles.push(thread::Builder::new().name("replica".into()).spawn(move || {
            server.replica_loop();
        })?);

        if self.config.retention.purge_interval_secs > 0 {
            let server = Arc::clone(self);
            handles.push(thread::Builder::new().name("purge".into()).spawn(move || {
                server.purge_loop();
            })?);
        }

        Ok(handles)
    }

    fn accept_control(&self, listener: &TcpListener) {
        for stream in listener.incoming() {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            match stream {
                Ok(conn) => {
                    if let Err(e) = self.serve_control(conn) {
                        warn!(error = %e, "control connection ended");
                    }
                }
                Err(e) => warn!(error = %e, "control accept failed"),
            }
        }
    }

    fn serve_control(&self, stream: TcpStream) -> Result<(), ReplError> {
        stream.set_read_timeout(Some(Duration::from_secs(300)))?;
        let mut writer = stream.try_clone()?;
        let mut reader = stream;
        let mut decoder = StreamDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            decoder.feed(&buf[..n]);
            while let Some(record) = decoder.next()? {
                let reply = self.handle_command(&record.argv);
                protocol::write_reply(&mut writer, &reply)?;
            }
        }
    }

    fn handle_command(&self, argv: &[Vec<u8>]) -> Reply {
        match argv[0].to_ascii_lowercase().as_slice() {
            b"ping" => Reply::Status("pong".to_string()),
            b"trysync" => self.node.handle_trysync(argv),
            b"set" | b"del" => match self.node.submit(&argv.iter().map(Vec::as_slice).collect::<Vec<_>>()) {
                Ok(()) => Reply::Status("OK".to_string()),
                Err(e) => Reply::Err(e.to_string()),
            },
            b"get" if argv.len() == 2 => match self.kv.get(&argv[1]) {
                Some(value) => Reply::Status(String::from_utf8_lossy(&value).into_owned()),
                None => Reply::Err("no such key".to_string()),
            },
            b"replicaof" => self.handle_replicaof(argv),
            b"purgeto" if argv.len() == 2 || argv.len() == 3 => {
                let force = argv.len() == 3 && argv[2].eq_ignore_ascii_case(b"force");
                match parse_u32(&argv[1]).and_then(|to| {
                    self.node.purge_to(to, force).map_err(|e| e.to_string())
                }) {
                    Ok(deleted) => Reply::Status(format!("purged {deleted}")),
                    Err(e) => Reply::Err(e),
                }
            }
            _ => Reply::Err("unknown command".to_string()),
        }
    }

    fn handle_replicaof(&self, argv: &[Vec<u8>]) -> Reply {
        // replicaof <ip> <port> [force] | replicaof no one
        if argv.len() == 3 && argv[1].eq_ignore_ascii_case(b"no") && argv[2].eq_ignore_ascii_case(b"one")
        {
            self.node.replicaof_none();
            return Reply::Status("OK".to_string());
        }
        if argv.len() != 3 && argv.len() != 4 {
            return Reply::Err("usage: replicaof <ip> <port> [force] | replicaof no one".to_string());
        }
        let Ok(ip) = std::str::from_utf8(&argv[1]) else {
            return Reply::Err("bad master ip".to_string());
        };
        let Some(port) = std::str::from_utf8(&argv[2]).ok().and_then(|s| s.parse().ok()) else {
            return Reply::Err("bad master port".to_string());
        };
        let force = argv.len() == 4 && argv[3].eq_ignore_ascii_case(b"force");
        match self.node.replicaof(ip, port, force) {
            Ok(()) => Reply::Status("OK".to_string()),
            Err(e) => Reply::Err(e.to_string()),
        }
    }

    fn accept_heartbeat(&self, listener: &TcpListener) {
        for stream in listener.incoming() {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            match stream {
                Ok(conn) => {
                    let sessions = Arc::clone(self.node.sessions());
                    let timeout =
                        Duration::from_millis(self.config.repl.heartbeat_timeout_ms);
                    thread::spawn(move || heartbeat::serve_heartbeat(conn, &sessions, timeout));
                }
                Err(e) => warn!(error = %e, "heartbeat accept failed"),
            }
        }
    }

    /// Replica-side driver: whenever the coordinator says `Connect`, run the
    /// TRYSYNC handshake and stream the log until a link drops.
    fn replica_loop(&self) {
        while !self.shutdown.load(Ordering::Acquire) {
            let Some(master) = self.node.coordinator().begin_handshake() else {
                thread::sleep(Duration::from_millis(200));
                continue;
            };
            if let Err(e) = self.sync_with_master(&master.ip, master.port) {
                warn!(error = %e, "replication attempt failed");
                self.node.coordinator().link_lost();
                thread::sleep(Duration::from_secs(1));
            }
        }
    }

    fn sync_with_master(&self, master_ip: &str, master_port: u16) -> Result<(), ReplError> {
        // the log-stream listener must be up before the master dials back
        let stream_port = self.config.port + LOG_STREAM_PORT_OFFSET;
        let stream_listener = TcpListener::bind((self.config.ip.as_str(), stream_port))?;

        let pos = self.node.producer_position();
        let mut control = TcpStream::connect((master_ip, master_port))?;
        control.set_read_timeout(Some(Duration::from_secs(10)))?;
        control.write_all(&protocol::trysync_command(
            &self.config.ip,
            self.config.port,
            pos.file_index,
            pos.offset,
        ))?;

        let mut reader = std::io::BufReader::new(control.try_clone()?);
        match protocol::read_reply(&mut reader)? {
            Reply::SessionId(sid) => {
                info!(sid, from = %pos, "incremental sync accepted by master");
                self.node.coordinator().handshake_accepted(sid);
            }
            Reply::WaitSnapshot => {
                warn!("master no longer holds our log range; waiting for snapshot");
                self.node.coordinator().wait_snapshot();
                return Ok(());
            }
            Reply::Err(e) => {
                self.node.coordinator().set_error();
                return Err(ReplError::Protocol(e));
            }
            Reply::Status(s) => {
                return Err(ReplError::Protocol(format!("unexpected reply: {s}")));
            }
        }

        // the master dialed back during the handshake; pick up the stream
        let (stream, peer) = stream_listener.accept()?;
        info!(%peer, "log stream connected");
        self.node.coordinator().link_up();

        // heartbeat probe runs until the link dies; a dead heartbeat also
        // shuts the ingest socket so the blocked read below unwinds and the
        // whole session re-handshakes
        let local_addr = self.config.local_addr();
        let coordinator = Arc::clone(self.node.coordinator());
        let interval = Duration::from_millis(self.config.repl.heartbeat_interval_ms);
        let timeout = Duration::from_millis(self.config.repl.heartbeat_timeout_ms);
        let stop = Arc::new(AtomicBool::new(false));
        let probe_stop = Arc::clone(&stop);
        let ingest_stream = stream.try_clone()?;
        let prober = thread::spawn(move || {
            if heartbeat::probe_master(&coordinator, &local_addr, interval, timeout, &probe_stop)
                .is_err()
            {
                let _ = ingest_stream.shutdown(Shutdown::Both);
            }
        });

        let mut pipeline = self.node.ingest_pipeline();
        let result = pipeline.run(stream);
        pipeline.reset();

        stop.store(true, Ordering::Release);
        if prober.join().is_err() {
            warn!("heartbeat prober panicked");
        }
        result
    }

    fn purge_loop(&self) {
        let interval = Duration::from_secs(self.config.retention.purge_interval_secs);
        while !self.shutdown.load(Ordering::Acquire) {
            thread::sleep(interval);
            match self.node.auto_purge() {
                Ok(0) => {}
                Ok(deleted) => info!(deleted, "auto-purged log files"),
                Err(e) => warn!(error = %e, "auto purge failed"),
            }
        }
    }
}

fn parse_u32(bytes: &[u8]) -> Result<u32, String> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| "bad file index".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_repl::NodeConfig;
    use keel_storage::WalConfig;
    use tempfile::TempDir;

    fn server(dir: &TempDir) -> Arc<Server> {
        let kv = Arc::new(KvStore::new());
        let mut config = ServerConfig::default();
        config.wal.dir = dir.path().to_path_buf();
        let node = ReplNode::open(
            NodeConfig::new(WalConfig::new(dir.path())),
            Arc::clone(&kv) as _,
            Arc::new(SnapshotStub),
        )
        .unwrap();
        Arc::new(Server {
            node: Arc::new(node),
            kv,
            config,
            shutdown: AtomicBool::new(false),
        })
    }

    #[test]
    fn test_ping() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let reply = server.handle_command(&[b"ping".to_vec()]);
        assert_eq!(reply, Reply::Status("pong".to_string()));
        server.node.shutdown();
    }

    #[test]
    fn test_set_then_get() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let reply = server.handle_command(&[b"set".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        assert_eq!(reply, Reply::Status("OK".to_string()));

        // apply is asynchronous; poll
        for _ in 0..200 {
            if server.kv.get(b"k").is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let reply = server.handle_command(&[b"get".to_vec(), b"k".to_vec()]);
        assert_eq!(reply, Reply::Status("v".to_string()));
        server.node.shutdown();
    }

    #[test]
    fn test_writes_rejected_on_replica() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let reply =
            server.handle_command(&[b"replicaof".to_vec(), b"10.0.0.9".to_vec(), b"9221".to_vec()]);
        assert_eq!(reply, Reply::Status("OK".to_string()));

        let reply = server.handle_command(&[b"set".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        assert!(matches!(reply, Reply::Err(_)));

        let reply =
            server.handle_command(&[b"replicaof".to_vec(), b"no".to_vec(), b"one".to_vec()]);
        assert_eq!(reply, Reply::Status("OK".to_string()));
        server.node.shutdown();
    }

    #[test]
    fn test_socket_shutdown_unblocks_ingest() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _master_side = TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let teardown = stream.try_clone().unwrap();

        let node = Arc::clone(&server.node);
        let ingest = thread::spawn(move || {
            let mut pipeline = node.ingest_pipeline();
            pipeline.run(stream)
        });

        // the read is blocked; shutting the socket (the heartbeat-failure
        // path) must unwind it
        thread::sleep(Duration::from_millis(50));
        teardown.shutdown(Shutdown::Both).unwrap();
        assert!(ingest.join().unwrap().is_err());
        server.node.shutdown();
    }

    #[test]
    fn test_unknown_command() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir);
        let reply = server.handle_command(&[b"frobnicate".to_vec()]);
        assert!(matches!(reply, Reply::Err(_)));
        server.node.shutdown();
    }
}
