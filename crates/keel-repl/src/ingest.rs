//! Replica-side ingest pipeline.
//!
//! Bytes from the master's log stream are decoded into records, stamped
//! with an arrival sequence number, and fanned out across the apply pool by
//! key. Each worker appends its record to the replica's WAL under the
//! sequence barrier, so the replica's log is byte-for-byte in the master's
//! order, then applies the command. Apply itself runs outside the barrier:
//! only the append is totally ordered, application is ordered per key.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keel_storage::{LogWriterPool, WalError};
use tracing::{error, info};

use crate::apply::ApplyPool;
use crate::barrier::SequenceBarrier;
use crate::decoder::{DecodedRecord, StreamDecoder};
use crate::error::ReplError;
use crate::node::CommandApplier;

const READ_BUF_SIZE: usize = 16 * 1024;

/// Decode-order-preserving front end to the apply pool.
pub struct IngestPipeline {
    writer: Arc<LogWriterPool>,
    pool: Arc<ApplyPool>,
    applier: Arc<dyn CommandApplier>,
    barrier: Arc<SequenceBarrier>,
    /// Set by a worker whose append failed; fails the loop on the next feed.
    failed: Arc<AtomicBool>,
    decoder: StreamDecoder,
    next_seq: u64,
}

impl IngestPipeline {
    /// Creates a pipeline feeding `pool`, appending through `writer` and
    /// applying through `applier`.
    #[must_use]
    pub fn new(
        writer: Arc<LogWriterPool>,
        pool: Arc<ApplyPool>,
        applier: Arc<dyn CommandApplier>,
    ) -> Self {
        Self {
            writer,
            pool,
            applier,
            barrier: Arc::new(SequenceBarrier::new()),
            failed: Arc::new(AtomicBool::new(false)),
            decoder: StreamDecoder::new(),
            next_seq: 0,
        }
    }

    /// Feeds raw stream bytes, dispatching every complete record.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Protocol`] on a malformed stream, or the
    /// storage error once a dispatched append has failed; either way the
    /// link should be dropped and the pipeline [`reset`](Self::reset).
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), ReplError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(ReplError::Wal(WalError::WritePathDisabled));
        }
        self.decoder.feed(bytes);
        while let Some(record) = self.decoder.next()? {
            self.dispatch(record);
        }
        Ok(())
    }

    /// Number of records dispatched since the last reset.
    #[must_use]
    pub fn dispatched(&self) -> u64 {
        self.next_seq
    }

    /// Drives the pipeline from a connected log stream until it drops.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::Disconnected`] when the master closes the link,
    /// or the underlying read/protocol error.
    pub fn run(&mut self, mut stream: TcpStream) -> Result<(), ReplError> {
        info!("ingest pipeline attached to log stream");
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Err(ReplError::Disconnected);
            }
            self.feed(&buf[..n])?;
        }
    }

    /// Abandons in-flight sequencing and starts numbering from zero again.
    /// Called between connections; records already dispatched may still be
    /// appended, later stragglers fail out through the closed barrier.
    pub fn reset(&mut self) {
        self.barrier.close();
        self.barrier = Arc::new(SequenceBarrier::new());
        self.failed = Arc::new(AtomicBool::new(false));
        self.decoder = StreamDecoder::new();
        self.next_seq = 0;
    }

    fn dispatch(&mut self, record: DecodedRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let key = record.partition_key().to_vec();
        let writer = Arc::clone(&self.writer);
        let applier = Arc::clone(&self.applier);
        let barrier = Arc::clone(&self.barrier);
        let failed = Arc::clone(&self.failed);

        let dispatch_key = key.clone();
        self.pool.dispatch(
            &dispatch_key,
            Box::new(move || {
                if barrier.wait_for(seq).is_err() {
                    return;
                }
                let appended = writer.submit(&key, record.raw, true);
                barrier.advance();
                match appended {
                    Ok(_) => applier.apply(&record.argv),
                    Err(e) => {
                        error!(seq, error = %e, "replicated append failed, dropping the link");
                        failed.store(true, Ordering::Release);
                    }
                }
            }),
        );
    }
}

impl std::fmt::Debug for IngestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("next_seq", &self.next_seq)
            .field("buffered", &self.decoder.buffered())
            .finish_non_exhaustive()
    }
}
