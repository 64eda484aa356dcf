//! Per-replica log sender.
//!
//! One thread per replica, tailing the WAL from the position negotiated at
//! handshake and writing raw records to the replica's log-stream socket.
//! Records are self-delimiting multibulk frames, so the stream needs no
//! extra framing. At the live tail the sender polls: end-of-log and torn
//! reads both mean "not durable yet, retry".

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use keel_storage::{ReadOutcome, ReplayReader};
use tracing::{error, info, warn};

use crate::session::SenderHandle;

/// Spawns a sender thread streaming `reader` into `stream`.
///
/// `on_exit` runs when the sender stops for any reason (remote hangup, log
/// corruption, or an explicit stop); it is where the session registry
/// removes the session.
pub fn spawn(
    reader: ReplayReader,
    stream: TcpStream,
    replica_addr: String,
    poll_interval: Duration,
    on_exit: Box<dyn FnOnce() + Send>,
) -> std::io::Result<Arc<SenderHandle>> {
    let file_index = Arc::new(AtomicU32::new(reader.position().file_index));
    let stop = Arc::new(AtomicBool::new(false));

    let thread_index = Arc::clone(&file_index);
    let thread_stop = Arc::clone(&stop);
    let handle = thread::Builder::new()
        .name(format!("log-sender-{replica_addr}"))
        .spawn(move || {
            run(reader, stream, &replica_addr, poll_interval, &thread_index, &thread_stop);
            on_exit();
        })?;

    Ok(Arc::new(SenderHandle::new(file_index, stop, handle)))
}

fn run(
    mut reader: ReplayReader,
    mut stream: TcpStream,
    replica_addr: &str,
    poll_interval: Duration,
    file_index: &AtomicU32,
    stop: &AtomicBool,
) {
    info!(replica_addr, from = %reader.position(), "log sender started");
    loop {
        if stop.load(Ordering::Acquire) {
            info!(replica_addr, "log sender stopping");
            return;
        }
        match reader.next_record() {
            Ok(ReadOutcome::Record { payload, .. }) => {
                file_index.store(reader.position().file_index, Ordering::Release);
                if let Err(e) = stream.write_all(&payload) {
                    warn!(replica_addr, error = %e, "replica link lost");
                    return;
                }
            }
            Ok(ReadOutcome::EndOfLog | ReadOutcome::TornWrite { .. }) => {
                file_index.store(reader.position().file_index, Ordering::Release);
                thread::sleep(poll_interval);
            }
            Ok(ReadOutcome::ChecksumMismatch { position }) => {
                error!(replica_addr, %position, "corrupt record under sender, stopping");
                return;
            }
            Err(e) => {
                error!(replica_addr, error = %e, "log sender read failed");
                return;
            }
        }
    }
}
