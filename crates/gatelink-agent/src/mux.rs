//! Stream multiplexer
//!
//! Carries many logical TCP connections over the single framed transport.
//! Each connection id owns an outbound queue in the connection map and two
//! forwarder tasks:
//!
//! - inbound (local socket -> gateway): emits CONTINUE frames until the
//!   socket ends, fails or the connection is cancelled
//! - outbound (gateway -> local socket): drains the queue in order until it
//!   sees [`Chunk::Close`], then shuts the socket's write side down
//!
//! Removing an id from the map always posts `Chunk::Close` first, so the
//! outbound task wakes up and exits even if no more data arrives.
//!
//! Map entries carry a generation. The gateway may reuse an id as soon as it
//! has closed it, so forwarders only ever remove the entry they were started
//! for. CLOSE goes to the gateway only when that removal succeeds, i.e. when
//! the connection ended on our side; a CLOSE from the gateway is not echoed.
//!
//! [`StreamMultiplexer::open_local`] is library API for embedders that accept
//! sockets themselves and want them carried to the gateway; the agent binary
//! only serves gateway-initiated connections.

use bytes::Bytes;
use gatelink_proto::{Frame, FrameType, SocketData, SocketDataKind};
use gatelink_transport::{FrameSender, HandlerError, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::{PoolError, PoolSlots, WorkerPool};

/// Ids the agent assigns itself; the gateway assigns ids below this bit
pub const LOCAL_ID_FLAG: u32 = 0x8000_0000;

/// Slots each logical connection takes from the worker pool
const SLOTS_PER_CONNECTION: u32 = 2;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// One entry of a connection's outbound queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Bytes),
    Close,
}

#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Where gateway-initiated connections are dialed (host:port)
    pub local_target: String,
    /// Read buffer per inbound forwarder
    pub buffer_size: usize,
    pub connect_timeout: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            local_target: "127.0.0.1:1080".to_string(),
            buffer_size: 16 * 1024,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Outbound queue of one connection, tagged with the generation that owns it
struct Entry {
    generation: u64,
    queue: mpsc::UnboundedSender<Chunk>,
}

type ConnectionMap = HashMap<u32, Entry>;

struct Inner {
    connections: Mutex<ConnectionMap>,
    sender: FrameSender,
    pool: WorkerPool,
    config: MultiplexerConfig,
    next_local_id: AtomicU32,
    next_generation: AtomicU64,
}

/// Maps connection ids onto the framed transport
#[derive(Clone)]
pub struct StreamMultiplexer {
    inner: Arc<Inner>,
}

impl StreamMultiplexer {
    pub fn new(sender: FrameSender, pool: WorkerPool, config: MultiplexerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connections: Mutex::new(HashMap::new()),
                sender,
                pool,
                config,
                next_local_id: AtomicU32::new(0),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    fn connections(&self) -> MutexGuard<'_, ConnectionMap> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live logical connections
    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    pub fn is_open(&self, connection_id: u32) -> bool {
        self.connections().contains_key(&connection_id)
    }

    /// Handler for inbound `SocketData` frames.
    ///
    /// Only a payload that does not decode is an error; everything that goes
    /// wrong on one connection stays on that connection.
    pub fn handle_frame(&self, frame: Frame) -> Result<(), HandlerError> {
        let data: SocketData = frame.message()?;
        let connection_id = data.connection_id;

        match data.kind {
            SocketDataKind::Start => self.on_start(connection_id),
            SocketDataKind::Continue(bytes) => {
                if !self.enqueue(connection_id, Chunk::Data(Bytes::from(bytes))) {
                    debug!(connection_id, "Data for unknown connection, dropping");
                }
            }
            SocketDataKind::Close => {
                if self.remove(connection_id) {
                    debug!(connection_id, "Connection closed by gateway");
                }
            }
        }

        Ok(())
    }

    fn enqueue(&self, connection_id: u32, chunk: Chunk) -> bool {
        match self.connections().get(&connection_id) {
            Some(entry) => entry.queue.send(chunk).is_ok(),
            None => false,
        }
    }

    /// Insert a fresh entry for `connection_id` unless one is live
    fn insert(&self, connection_id: u32) -> Option<(u64, mpsc::UnboundedReceiver<Chunk>)> {
        let mut connections = self.connections();
        if connections.contains_key(&connection_id) {
            return None;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (queue, rx) = mpsc::unbounded_channel();
        connections.insert(connection_id, Entry { generation, queue });
        Some((generation, rx))
    }

    /// Remove whatever connection currently holds `connection_id`.
    /// Returns false if it was already gone.
    pub fn remove(&self, connection_id: u32) -> bool {
        let mut connections = self.connections();
        match connections.remove(&connection_id) {
            Some(entry) => {
                let _ = entry.queue.send(Chunk::Close);
                true
            }
            None => false,
        }
    }

    /// Remove `connection_id` only if it still belongs to `generation`
    fn remove_generation(&self, connection_id: u32, generation: u64) -> bool {
        let mut connections = self.connections();
        match connections.get(&connection_id) {
            Some(entry) if entry.generation == generation => {
                if let Some(entry) = connections.remove(&connection_id) {
                    let _ = entry.queue.send(Chunk::Close);
                }
                true
            }
            _ => false,
        }
    }

    /// Remove every connection, e.g. when the session ends
    pub fn shutdown(&self) {
        let mut connections = self.connections();
        let count = connections.len();
        for (_, entry) in connections.drain() {
            let _ = entry.queue.send(Chunk::Close);
        }
        if count > 0 {
            info!("Closed {} logical connections", count);
        }
    }

    fn send_close(&self, connection_id: u32) {
        if let Err(e) = self
            .inner
            .sender
            .send_message(FrameType::SocketData, &SocketData::close(connection_id))
        {
            debug!(connection_id, "Could not send CLOSE: {}", e);
        }
    }

    fn on_start(&self, connection_id: u32) {
        let Some((generation, rx)) = self.insert(connection_id) else {
            warn!(connection_id, "Duplicate START for live connection, ignoring");
            return;
        };

        debug!(connection_id, generation, "Connection requested by gateway");
        let mux = self.clone();
        tokio::spawn(async move {
            mux.setup_remote(connection_id, generation, rx).await;
        });
    }

    async fn setup_remote(
        &self,
        connection_id: u32,
        generation: u64,
        rx: mpsc::UnboundedReceiver<Chunk>,
    ) {
        let slots = match self.inner.pool.acquire(SLOTS_PER_CONNECTION).await {
            Ok(slots) => slots,
            Err(e) => {
                warn!(connection_id, "Rejecting connection: {}", e);
                self.abort(connection_id, generation);
                return;
            }
        };

        let target = &self.inner.config.local_target;
        let stream = match tokio::time::timeout(
            self.inner.config.connect_timeout,
            TcpStream::connect(target.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(connection_id, "Failed to connect to {}: {}", target, e);
                self.abort(connection_id, generation);
                return;
            }
            Err(_) => {
                warn!(connection_id, "Timed out connecting to {}", target);
                self.abort(connection_id, generation);
                return;
            }
        };

        // A CLOSE that arrived during setup is already queued behind any data
        let _ = stream.set_nodelay(true);
        self.spawn_forwarders(connection_id, generation, stream, rx, slots);
    }

    /// Give up on a connection that never got its forwarders
    fn abort(&self, connection_id: u32, generation: u64) {
        if self.remove_generation(connection_id, generation) {
            self.send_close(connection_id);
        }
    }

    /// Carry a locally accepted socket to the gateway under a new id
    pub async fn open_local(&self, stream: TcpStream) -> Result<u32, MuxError> {
        let slots = self.inner.pool.acquire(SLOTS_PER_CONNECTION).await?;

        let (connection_id, generation, rx) = loop {
            let connection_id = LOCAL_ID_FLAG
                | (self.inner.next_local_id.fetch_add(1, Ordering::Relaxed) & !LOCAL_ID_FLAG);
            if let Some((generation, rx)) = self.insert(connection_id) {
                break (connection_id, generation, rx);
            }
        };

        if let Err(e) = self
            .inner
            .sender
            .send_message(FrameType::SocketData, &SocketData::start(connection_id))
        {
            warn!(connection_id, "Could not send START: {}", e);
            self.remove_generation(connection_id, generation);
            return Err(e.into());
        }

        debug!(connection_id, "Local connection opened");
        self.spawn_forwarders(connection_id, generation, stream, rx, slots);
        Ok(connection_id)
    }

    fn spawn_forwarders(
        &self,
        connection_id: u32,
        generation: u64,
        stream: TcpStream,
        rx: mpsc::UnboundedReceiver<Chunk>,
        slots: PoolSlots,
    ) {
        let (read_half, write_half) = stream.into_split();
        let cancel = CancellationToken::new();
        let slots = Arc::new(slots);

        let inbound = self.clone();
        let inbound_cancel = cancel.clone();
        let inbound_slots = slots.clone();
        tokio::spawn(async move {
            inbound
                .forward_inbound(connection_id, generation, read_half, inbound_cancel)
                .await;
            drop(inbound_slots);
        });

        let outbound = self.clone();
        tokio::spawn(async move {
            outbound
                .forward_outbound(connection_id, write_half, rx, cancel)
                .await;
            drop(slots);
        });
    }

    async fn forward_inbound(
        &self,
        connection_id: u32,
        generation: u64,
        mut reader: OwnedReadHalf,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; self.inner.config.buffer_size];
        let mut forwarded = 0u64;

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = SocketData::chunk(connection_id, buf[..n].to_vec());
                    if self
                        .inner
                        .sender
                        .send_message(FrameType::SocketData, &chunk)
                        .is_err()
                    {
                        break;
                    }
                    forwarded += n as u64;
                }
                Err(e) => {
                    debug!(connection_id, "Local read failed: {}", e);
                    break;
                }
            }
        }

        // Still ours means nobody closed it from the gateway side
        if self.remove_generation(connection_id, generation) {
            self.send_close(connection_id);
        }
        debug!(connection_id, bytes = forwarded, "Inbound forwarder finished");
    }

    async fn forward_outbound(
        &self,
        connection_id: u32,
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Chunk>,
        cancel: CancellationToken,
    ) {
        let mut forwarded = 0u64;

        while let Some(chunk) = rx.recv().await {
            match chunk {
                Chunk::Data(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        debug!(connection_id, "Local write failed: {}", e);
                        break;
                    }
                    forwarded += bytes.len() as u64;
                }
                Chunk::Close => break,
            }
        }

        // The inbound side does the removal and reports the close if needed
        let _ = writer.shutdown().await;
        cancel.cancel();
        debug!(connection_id, bytes = forwarded, "Outbound forwarder finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatelink_transport::{FrameTransport, TrafficCounter};

    fn frame_for(data: &SocketData) -> Frame {
        Frame::new(
            FrameType::SocketData,
            0,
            Frame::payload_for(data).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_data_for_unknown_connection_is_dropped() {
        let (io, _peer) = tokio::io::duplex(1024);
        let transport = FrameTransport::new(io, TrafficCounter::new());
        let mux = StreamMultiplexer::new(
            transport.sender,
            WorkerPool::new(4, 0, Duration::from_millis(1)),
            MultiplexerConfig::default(),
        );

        let frame = frame_for(&SocketData::chunk(99, vec![1, 2, 3]));
        assert!(mux.handle_frame(frame).is_ok());
        assert_eq!(mux.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_handler_error() {
        let (io, _peer) = tokio::io::duplex(1024);
        let transport = FrameTransport::new(io, TrafficCounter::new());
        let mux = StreamMultiplexer::new(
            transport.sender,
            WorkerPool::new(4, 0, Duration::from_millis(1)),
            MultiplexerConfig::default(),
        );

        let frame = Frame::new(FrameType::SocketData, 0, Bytes::from_static(&[0xFF]));
        assert!(mux.handle_frame(frame).is_err());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent_and_posts_close() {
        let (io, _peer) = tokio::io::duplex(1024);
        let transport = FrameTransport::new(io, TrafficCounter::new());
        let mux = StreamMultiplexer::new(
            transport.sender,
            WorkerPool::new(4, 0, Duration::from_millis(1)),
            MultiplexerConfig::default(),
        );

        let (_, mut rx) = mux.insert(5).unwrap();

        assert!(mux.remove(5));
        assert!(!mux.remove(5));
        assert_eq!(rx.recv().await, Some(Chunk::Close));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_stale_generation_leaves_reused_id_alone() {
        let (io, _peer) = tokio::io::duplex(1024);
        let transport = FrameTransport::new(io, TrafficCounter::new());
        let mux = StreamMultiplexer::new(
            transport.sender,
            WorkerPool::new(4, 0, Duration::from_millis(1)),
            MultiplexerConfig::default(),
        );

        let (old, _old_rx) = mux.insert(5).unwrap();
        assert!(mux.insert(5).is_none());
        assert!(mux.remove(5));

        let (new, mut new_rx) = mux.insert(5).unwrap();
        assert_ne!(old, new);

        assert!(!mux.remove_generation(5, old));
        assert!(mux.is_open(5));
        assert!(new_rx.try_recv().is_err());

        assert!(mux.remove_generation(5, new));
        assert_eq!(new_rx.recv().await, Some(Chunk::Close));
    }
}
