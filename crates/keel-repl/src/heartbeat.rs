//! Replication heartbeat.
//!
//! The replica probes the master's heartbeat port at a fixed interval. The
//! master answers pongs, and the first ping is what promotes the replica's
//! session from `Requested` to `Established`. A replica counts its
//! heartbeat sub-link as up only after two consecutive pongs, so a port
//! that accepts connections but never answers does not count.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::ReplError;
use crate::session::SessionRegistry;
use crate::state::SyncCoordinator;
use crate::HEARTBEAT_PORT_OFFSET;

/// Consecutive pongs required before the heartbeat link counts as up.
pub const PROBES_BEFORE_PROMOTION: u32 = 2;

/// Replica side: probes the configured master until the link fails or
/// `stop` is set.
///
/// `local_addr` identifies this replica to the master (the same `ip:port`
/// it used in TRYSYNC). Reports `link_up` to the coordinator after
/// [`PROBES_BEFORE_PROMOTION`] pongs and `link_lost` when probing fails.
///
/// # Errors
///
/// Returns the connection or probe error that ended the link. A stop
/// request ends the loop with `Ok(())`.
pub fn probe_master(
    coordinator: &SyncCoordinator,
    local_addr: &str,
    interval: Duration,
    timeout: Duration,
    stop: &AtomicBool,
) -> Result<(), ReplError> {
    let Some(master) = coordinator.master() else {
        return Ok(());
    };

    let result = probe_loop(coordinator, &master.ip, master.port, local_addr, interval, timeout, stop);
    if let Err(e) = &result {
        warn!(error = %e, "heartbeat link failed");
        coordinator.link_lost();
    }
    result
}

fn probe_loop(
    coordinator: &SyncCoordinator,
    master_ip: &str,
    master_port: u16,
    local_addr: &str,
    interval: Duration,
    timeout: Duration,
    stop: &AtomicBool,
) -> Result<(), ReplError> {
    let stream = TcpStream::connect((master_ip, master_port + HEARTBEAT_PORT_OFFSET))?;
    stream.set_read_timeout(Some(timeout))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let mut pongs = 0u32;
    let mut promoted = false;
    while !stop.load(Ordering::Acquire) {
        writer.write_all(format!("ping {local_addr}\r\n").as_bytes())?;
        writer.flush()?;

        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| map_read_err(e, "heartbeat pong"))?;
        if n == 0 {
            return Err(ReplError::Disconnected);
        }
        if line.trim_end() != "+pong" {
            return Err(ReplError::Protocol(format!("bad pong: {line:?}")));
        }

        pongs += 1;
        if !promoted && pongs >= PROBES_BEFORE_PROMOTION {
            debug!(pongs, "heartbeat link confirmed");
            coordinator.link_up();
            promoted = true;
        }
        thread::sleep(interval);
    }
    Ok(())
}

/// Master side: answers pings on one heartbeat connection until the replica
/// goes quiet, then drops its session.
///
/// The first ping names the replica and promotes its session to
/// `Established`. When the connection dies the session is removed, which
/// also stops the replica's log sender.
pub fn serve_heartbeat(stream: TcpStream, sessions: &Arc<SessionRegistry>, timeout: Duration) {
    let mut replica_addr = None;
    if let Err(e) = serve_loop(stream, sessions, timeout, &mut replica_addr) {
        debug!(error = %e, "heartbeat connection ended");
    }
    if let Some(addr) = replica_addr {
        info!(addr, "heartbeat lost, dropping replica session");
        sessions.remove(&addr);
    }
}

fn serve_loop(
    stream: TcpStream,
    sessions: &Arc<SessionRegistry>,
    timeout: Duration,
    replica_addr: &mut Option<String>,
) -> Result<(), ReplError> {
    stream.set_read_timeout(Some(timeout))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| map_read_err(e, "heartbeat ping"))?;
        if n == 0 {
            return Err(ReplError::Disconnected);
        }
        let line = line.trim_end();
        let Some(addr) = line.strip_prefix("ping ") else {
            return Err(ReplError::Protocol(format!("bad ping: {line:?}")));
        };
        if replica_addr.is_none() {
            sessions.establish(addr);
            *replica_addr = Some(addr.to_string());
        }
        writer.write_all(b"+pong\r\n")?;
        writer.flush()?;
    }
}

/// A read that hit its deadline is a [`ReplError::Timeout`], not a plain IO
/// failure; callers distinguish a dead peer from a slow one.
fn map_read_err(e: std::io::Error, during: &str) -> ReplError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ReplError::Timeout {
            during: during.to_string(),
        },
        _ => ReplError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStage;
    use crate::state::ReplState;
    use std::net::TcpListener;

    fn heartbeat_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_port = listener.local_addr().unwrap().port() - HEARTBEAT_PORT_OFFSET;
        (listener, base_port)
    }

    #[test]
    fn test_ping_establishes_session_and_link() {
        let (listener, base_port) = heartbeat_listener();
        let sessions = Arc::new(SessionRegistry::new());
        sessions.register("replica:1").unwrap();

        let serve_sessions = Arc::clone(&sessions);
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            serve_heartbeat(conn, &serve_sessions, Duration::from_millis(500));
        });

        let coordinator = Arc::new(SyncCoordinator::new());
        coordinator.set_master("127.0.0.1", base_port, false);
        coordinator.begin_handshake().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let probe_coord = Arc::clone(&coordinator);
        let probe_stop = Arc::clone(&stop);
        let prober = thread::spawn(move || {
            probe_master(
                &probe_coord,
                "replica:1",
                Duration::from_millis(10),
                Duration::from_millis(500),
                &probe_stop,
            )
        });

        // two pongs promote the heartbeat sub-link
        for _ in 0..200 {
            if sessions.stage("replica:1") == Some(SessionStage::Established) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sessions.stage("replica:1"), Some(SessionStage::Established));

        stop.store(true, Ordering::Release);
        prober.join().unwrap().unwrap();
        // one of the two sub-links is up
        coordinator.link_up();
        assert_eq!(coordinator.state(), ReplState::Connected);
        server.join().unwrap();
    }

    #[test]
    fn test_probe_failure_reports_link_lost() {
        let (listener, base_port) = heartbeat_listener();
        drop(listener);

        let coordinator = SyncCoordinator::new();
        coordinator.set_master("127.0.0.1", base_port, false);
        coordinator.begin_handshake().unwrap();

        let stop = AtomicBool::new(false);
        let result = probe_master(
            &coordinator,
            "replica:1",
            Duration::from_millis(10),
            Duration::from_millis(100),
            &stop,
        );
        assert!(result.is_err());
        assert_eq!(coordinator.state(), ReplState::Connect);
    }

    #[test]
    fn test_silent_master_times_out_probe() {
        let (listener, base_port) = heartbeat_listener();
        // accept the probe but never answer
        let server = thread::spawn(move || {
            let (_conn, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(500));
        });

        let coordinator = SyncCoordinator::new();
        coordinator.set_master("127.0.0.1", base_port, false);
        coordinator.begin_handshake().unwrap();

        let stop = AtomicBool::new(false);
        let result = probe_master(
            &coordinator,
            "replica:1",
            Duration::from_millis(10),
            Duration::from_millis(50),
            &stop,
        );
        assert!(matches!(result, Err(ReplError::Timeout { .. })));
        assert_eq!(coordinator.state(), ReplState::Connect);
        server.join().unwrap();
    }

    #[test]
    fn test_silent_master_session_dropped() {
        let (listener, _base_port) = heartbeat_listener();
        let addr = listener.local_addr().unwrap();
        let sessions = Arc::new(SessionRegistry::new());
        sessions.register("replica:2").unwrap();

        let serve_sessions = Arc::clone(&sessions);
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            serve_heartbeat(conn, &serve_sessions, Duration::from_millis(50));
        });

        let mut conn = TcpStream::connect(addr).unwrap();
        conn.write_all(b"ping replica:2\r\n").unwrap();
        let mut reader = BufReader::new(conn.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim_end(), "+pong");

        // go quiet; the read timeout fires and the session is dropped
        server.join().unwrap();
        assert!(sessions.is_empty());
    }
}
