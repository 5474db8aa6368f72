//! Channel abstraction the envelopes travel over.
//!
//! The master talks to each child over a private bidirectional channel.
//! The write side is serialized per endpoint; reads are owned by a single
//! demux loop. [`StdioChannel`] frames envelopes as newline-delimited JSON
//! over a child's piped stdio, and [`pair`] builds two connected in-memory
//! channels for tests and in-process hosts.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::error::PeepsyError;

/// Bidirectional envelope transport between a master and one worker.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Serialize and send one envelope. Write ordering follows call order.
    async fn send(&self, envelope: &Envelope) -> Result<(), PeepsyError>;

    /// Receive the next envelope; `None` once the peer is gone.
    async fn recv(&self) -> Option<Envelope>;

    /// Disconnect. Subsequent sends fail; the peer's reads drain and end.
    async fn close(&self);
}

/// Newline-delimited JSON over a byte stream (child stdin/stdout).
///
/// Lines that fail to parse are logged and skipped rather than tearing the
/// channel down; a garbled line loses one envelope, not the worker.
pub struct StdioChannel<R, W> {
    reader: Mutex<Lines<BufReader<R>>>,
    writer: Mutex<BufWriter<W>>,
    closed: AtomicBool,
}

impl<R, W> StdioChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader).lines()),
            writer: Mutex::new(BufWriter::new(writer)),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<R, W> Channel for StdioChannel<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, envelope: &Envelope) -> Result<(), PeepsyError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(PeepsyError::process("Channel is closed"));
        }
        let mut line = serde_json::to_string(envelope)?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Option<Envelope> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Envelope>(&line) {
                        Ok(envelope) => return Some(envelope),
                        Err(e) => {
                            warn!("Dropping unparseable envelope line: {}", e);
                        }
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    debug!("Channel read error, treating as disconnect: {}", e);
                    return None;
                }
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// In-memory channel endpoint, created in connected pairs by [`pair`].
///
/// `close` must interrupt a reader parked inside `recv`, so teardown is
/// signalled through a cancellation token rather than by closing the
/// receiver (which would need the same lock the parked reader holds).
pub struct MemoryChannel {
    tx: Mutex<Option<mpsc::Sender<Envelope>>>,
    rx: Mutex<mpsc::Receiver<Envelope>>,
    closed: CancellationToken,
}

/// Two connected in-memory channels; what one sends, the other receives.
pub fn pair() -> (MemoryChannel, MemoryChannel) {
    let (a_tx, b_rx) = mpsc::channel(256);
    let (b_tx, a_rx) = mpsc::channel(256);
    (
        MemoryChannel {
            tx: Mutex::new(Some(a_tx)),
            rx: Mutex::new(a_rx),
            closed: CancellationToken::new(),
        },
        MemoryChannel {
            tx: Mutex::new(Some(b_tx)),
            rx: Mutex::new(b_rx),
            closed: CancellationToken::new(),
        },
    )
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, envelope: &Envelope) -> Result<(), PeepsyError> {
        if self.closed.is_cancelled() {
            return Err(PeepsyError::process("Channel is closed"));
        }
        let tx = self.tx.lock().await;
        match tx.as_ref() {
            Some(tx) => tx
                .send(envelope.clone())
                .await
                .map_err(|_| PeepsyError::process("Channel peer is gone")),
            None => Err(PeepsyError::process("Channel is closed")),
        }
    }

    async fn recv(&self) -> Option<Envelope> {
        tokio::select! {
            _ = self.closed.cancelled() => None,
            envelope = async { self.rx.lock().await.recv().await } => envelope,
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        self.tx.lock().await.take();
    }
}
