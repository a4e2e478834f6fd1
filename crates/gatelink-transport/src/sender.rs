//! Send side of the transport
//!
//! All outgoing frames go through one unbounded queue drained by a single
//! writer task. The task owns the write half and the [`FrameEncoder`], so
//! envelopes reach the wire whole, in queue order, with consecutive
//! sequence numbers no matter how many tasks are sending.

use bytes::Bytes;
use gatelink_proto::{Frame, FrameEncoder, FrameType, HEADER_SIZE, MAX_FRAME_SIZE};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::TransportError;

/// Bytes moved over the transport, envelope headers included
#[derive(Debug, Clone, Default)]
pub struct TrafficCounter {
    sent: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
}

impl TrafficCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub(crate) fn add_sent(&self, n: usize) {
        self.sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_received(&self, frame: &Frame) {
        let n = HEADER_SIZE + 1 + frame.payload.len();
        self.received.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Cancels a transport: stops the dispatch loop and the writer task.
///
/// Clones share the same underlying token; closing more than once is a no-op.
#[derive(Debug, Clone, Default)]
pub struct TransportCloser {
    token: CancellationToken,
}

impl TransportCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        if !self.token.is_cancelled() {
            debug!("Closing transport");
        }
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

struct Outbound {
    frame_type: FrameType,
    payload: Bytes,
}

/// Non-blocking, cloneable handle for queueing frames
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("frame_type", &self.frame_type)
            .field("len", &self.payload.len())
            .finish()
    }
}

impl FrameSender {
    /// Queue a frame. Never waits for the wire.
    ///
    /// Fails if the payload can never be framed or the writer task is gone.
    pub fn send_frame(&self, frame_type: FrameType, payload: Bytes) -> Result<(), TransportError> {
        if 1 + payload.len() > MAX_FRAME_SIZE as usize {
            return Err(gatelink_proto::FrameError::PayloadTooLarge(payload.len()).into());
        }

        self.tx
            .send(Outbound {
                frame_type,
                payload,
            })
            .map_err(|_| TransportError::WriterClosed)
    }

    /// Serialize `message` and queue it as a frame of `frame_type`
    pub fn send_message<T: Serialize>(
        &self,
        frame_type: FrameType,
        message: &T,
    ) -> Result<(), TransportError> {
        let payload = Frame::payload_for(message)?;
        self.send_frame(frame_type, payload)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start the writer task for `writer`.
///
/// The task exits when every sender is dropped or the transport is closed,
/// and shuts the write half down on the way out. A write failure closes the
/// whole transport.
pub(crate) fn spawn_writer<W>(
    writer: W,
    closer: TransportCloser,
    counter: TrafficCounter,
) -> (FrameSender, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_writer(writer, rx, closer, counter));
    (FrameSender { tx }, handle)
}

async fn run_writer<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    closer: TransportCloser,
    counter: TrafficCounter,
) where
    W: AsyncWrite + Unpin,
{
    let mut encoder = FrameEncoder::new();

    loop {
        let outbound = tokio::select! {
            biased;
            _ = closer.closed() => break,
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        let bytes = match encoder.encode(outbound.frame_type, &outbound.payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Dropping unframeable {:?}: {}", outbound.frame_type, e);
                continue;
            }
        };

        let written = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            error!("Transport write failed: {}", e);
            closer.close();
            break;
        }

        counter.add_sent(bytes.len());
        trace!(
            frame_type = ?outbound.frame_type,
            sequence = encoder.next_sequence() - 1,
            "Frame written"
        );
    }

    let _ = writer.shutdown().await;
    debug!("Writer task stopped after {} frames", encoder.next_sequence());
}
