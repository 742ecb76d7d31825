//! Streaming ingestion channel.
//!
//! Opens a UUT's data socket once per session and turns the byte stream into
//! committed blocks. Two tasks cooperate:
//!
//! ```text
//! socket ──read──▶ BlockAssembler ──try_send──▶ [bounded queue] ──▶ writer ──▶ GuardedSink
//! ```
//!
//! The reader never waits on storage. When the queue is full the block that did
//! not fit is reported lost in an [`AcqError::Overrun`] and the session ends;
//! everything already queued is still committed before the error is returned.
//! Silence on the socket for longer than the stall window ends the session with
//! [`AcqError::StreamStalled`], distinct from a clean remote close.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::framing::{demux, BlockAssembler, StreamBlock, StreamLayout};
use super::sink::{BlockSink, GuardedSink};
use crate::error::{AcqError, AcqResult, LastExchange};
use crate::uut::{Endpoint, UutId};

/// Explicit streaming parameters.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Frame geometry
    pub layout: StreamLayout,
    /// Capacity of the block queue between reader and writer
    pub queue_depth: usize,
    /// Inactivity window before the stream counts as stalled
    pub stall_timeout: Duration,
    /// Bound on opening the data socket
    pub connect_timeout: Duration,
    /// Socket read size
    pub read_chunk: usize,
    /// End cleanly after this many bytes
    pub max_bytes: Option<u64>,
    /// End cleanly after this long
    pub runtime: Option<Duration>,
}

impl StreamSettings {
    /// Settings with default queue, timeouts and no limits.
    pub fn new(layout: StreamLayout) -> Self {
        Self {
            layout,
            queue_depth: 64,
            stall_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            read_chunk: 64 * 1024,
            max_bytes: None,
            runtime: None,
        }
    }

    fn validate(&self) -> AcqResult<()> {
        if self.queue_depth == 0 {
            return Err(AcqError::InvalidConfig("stream queue depth must be non-zero".into()));
        }
        if self.read_chunk == 0 {
            return Err(AcqError::InvalidConfig("stream read chunk must be non-zero".into()));
        }
        if self.stall_timeout.is_zero() {
            return Err(AcqError::InvalidConfig("stall timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Why a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The UUT closed the socket
    RemoteClosed,
    /// The caller cancelled
    Cancelled,
    /// A byte or runtime limit was reached
    LimitReached,
}

/// Result of a clean session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    /// Unit streamed from
    pub uut: UutId,
    /// Bytes accepted from the socket
    pub bytes: u64,
    /// Blocks committed to the sink
    pub blocks: u64,
    /// How the session ended
    pub end: StreamEnd,
    /// Trailing bytes that did not form a whole frame
    pub discarded_tail_bytes: usize,
    /// Session duration
    pub elapsed: Duration,
}

/// One streaming session against one UUT.
#[derive(Debug)]
pub struct StreamSession {
    uut: UutId,
    endpoint: Endpoint,
    settings: StreamSettings,
    cancel: CancellationToken,
}

impl StreamSession {
    /// Prepare a session; nothing is opened until [`run`](Self::run).
    pub fn new(
        uut: UutId,
        endpoint: Endpoint,
        settings: StreamSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            uut,
            endpoint,
            settings,
            cancel,
        }
    }

    /// Stream into `sink` until the socket closes, a limit is hit, the caller
    /// cancels or a fault ends the session.
    pub async fn run<S>(self, sink: S) -> AcqResult<StreamSummary>
    where
        S: BlockSink + 'static,
    {
        self.settings.validate()?;
        let started = Instant::now();
        let mut socket = self.open().await?;
        let layout = self.settings.layout;
        info!(
            uut = %self.uut,
            addr = %self.endpoint.data_addr(),
            channels = layout.channels(),
            datatype = %layout.datatype(),
            block_bytes = layout.block_bytes(),
            demux = layout.demux(),
            "stream session started"
        );

        let (tx, rx) = mpsc::channel::<StreamBlock>(self.settings.queue_depth);
        let writer = tokio::spawn(write_blocks(rx, GuardedSink::new(sink)));

        let mut assembler = BlockAssembler::new(layout);
        let mut buf = vec![0u8; self.settings.read_chunk];
        let mut bytes: u64 = 0;
        let deadline = self.settings.runtime.map(|r| started + r);

        let outcome: AcqResult<StreamEnd> = loop {
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(StreamEnd::Cancelled),
                _ = sleep_until_opt(deadline) => break Ok(StreamEnd::LimitReached),
                read = timeout(self.settings.stall_timeout, socket.read(&mut buf)) => read,
            };
            let n = match read {
                Err(_) => {
                    break Err(AcqError::StreamStalled {
                        uut: self.uut.clone(),
                        idle: self.settings.stall_timeout,
                        bytes,
                    })
                }
                Ok(Err(source)) => break Err(self.connection_error("stream read", source)),
                Ok(Ok(0)) => break Ok(StreamEnd::RemoteClosed),
                Ok(Ok(n)) => n,
            };

            let take = match self.settings.max_bytes {
                Some(max) => n.min(usize::try_from(max - bytes).unwrap_or(usize::MAX)),
                None => n,
            };
            bytes += take as u64;
            if let Err(e) = self.enqueue_all(&tx, assembler.push(&buf[..take])) {
                break Err(e);
            }
            if self.settings.max_bytes.is_some_and(|max| bytes >= max) {
                break Ok(StreamEnd::LimitReached);
            }
        };

        // drain: trailing whole frames, then everything queued
        let mut discarded_tail_bytes = 0;
        if outcome.is_ok() {
            let (tail, partial) = assembler.finish();
            discarded_tail_bytes = partial;
            if partial > 0 {
                warn!(uut = %self.uut, bytes = partial, "discarding trailing partial frame");
            }
            for block in tail.into_iter().flat_map(|b| self.split(b)) {
                if tx.send(block).await.is_err() {
                    break;
                }
            }
        }
        drop(tx);
        let written = match writer.await {
            Ok(result) => result,
            Err(join) => Err(AcqError::Storage(std::io::Error::other(format!(
                "stream writer task failed: {join}"
            )))),
        };
        if let Err(e) = socket.shutdown().await {
            debug!(uut = %self.uut, "data socket shutdown: {}", e);
        }

        let (end, blocks) = match (outcome, written) {
            (Ok(end), Ok(blocks)) => (end, blocks),
            // the writer's failure is the root cause when it closed the queue
            (Err(AcqError::Cancelled), Err(e)) | (Ok(_), Err(e)) => return Err(e),
            (Err(e), Err(werr)) => {
                warn!(uut = %self.uut, "writer also failed: {}", werr);
                return Err(e);
            }
            (Err(e), Ok(blocks)) => {
                warn!(uut = %self.uut, blocks, bytes, "stream session failed: {}", e);
                return Err(e);
            }
        };

        let summary = StreamSummary {
            uut: self.uut.clone(),
            bytes,
            blocks,
            end,
            discarded_tail_bytes,
            elapsed: started.elapsed(),
        };
        info!(
            uut = %self.uut,
            bytes,
            blocks,
            end = ?end,
            mb_per_sec = rate_mb(bytes, summary.elapsed),
            "stream session finished"
        );
        Ok(summary)
    }

    async fn open(&self) -> AcqResult<TcpStream> {
        let addr = self.endpoint.data_addr();
        match timeout(self.settings.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(socket)) => Ok(socket),
            Ok(Err(source)) => Err(self.connection_error("stream connect", source)),
            Err(_) => Err(self.connection_error(
                "stream connect",
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no connection to {addr} within {:?}", self.settings.connect_timeout),
                ),
            )),
        }
    }

    fn split(&self, block: StreamBlock) -> Vec<StreamBlock> {
        if self.settings.layout.demux() {
            demux(&block, &self.settings.layout)
        } else {
            vec![block]
        }
    }

    /// Queue without waiting. A full queue is an overrun; a closed one means the
    /// writer failed and its error is collected after the loop.
    fn enqueue_all(
        &self,
        tx: &mpsc::Sender<StreamBlock>,
        blocks: Vec<StreamBlock>,
    ) -> AcqResult<()> {
        for block in blocks.into_iter().flat_map(|b| self.split(b)) {
            match tx.try_send(block) {
                Ok(()) => {}
                Err(TrySendError::Full(lost)) => {
                    let buffered = self.settings.queue_depth - tx.capacity();
                    warn!(
                        uut = %self.uut,
                        channel = %lost.channel,
                        sequence = lost.sequence,
                        buffered,
                        "block queue full, storage is not keeping up"
                    );
                    return Err(AcqError::Overrun {
                        uut: self.uut.clone(),
                        channel: lost.channel,
                        lost_sequence: lost.sequence,
                        buffered,
                    });
                }
                Err(TrySendError::Closed(_)) => return Err(AcqError::Cancelled),
            }
        }
        Ok(())
    }

    fn connection_error(&self, operation: &str, source: std::io::Error) -> AcqError {
        AcqError::Connection {
            uut: self.uut.clone(),
            operation: operation.to_string(),
            source,
            last: LastExchange(None),
        }
    }
}

async fn write_blocks<S: BlockSink>(
    mut rx: mpsc::Receiver<StreamBlock>,
    mut sink: GuardedSink<S>,
) -> AcqResult<u64> {
    let mut committed = 0;
    while let Some(block) = rx.recv().await {
        sink.commit(block).await?;
        committed += 1;
    }
    sink.finish().await?;
    Ok(committed)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn rate_mb(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / 1e6 / secs
    } else {
        0.0
    }
}
