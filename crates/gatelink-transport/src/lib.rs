//! Framed transport for the gatelink tunnel
//!
//! Turns one duplex byte stream (normally TLS to the gateway) into:
//! - a cloneable, non-blocking [`FrameSender`] backed by a single writer task
//! - a [`FrameReader`] with a synchronous-style `read_one_frame` for the
//!   handshake phase and a `start_dispatching` loop for the rest of the session
//! - a [`TransportCloser`], the one way to cancel a session

pub mod dispatch;
pub mod sender;
pub mod tls;

pub use dispatch::{DispatchError, DispatchTable, FrameHandler, FrameReader, HandlerError};
pub use sender::{FrameSender, TrafficCounter, TransportCloser};
pub use tls::{load_ca_certificates, GatewayConnector, GatewayStream, TlsSettings};

use gatelink_proto::{FrameError, FrameType};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::task::JoinHandle;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Framing fault: {0}")]
    Frame(#[from] FrameError),

    #[error("Transport closed locally")]
    Aborted,

    #[error("Writer task has stopped")]
    WriterClosed,

    #[error("Handler for {frame_type:?} failed: {message}")]
    Handler {
        frame_type: FrameType,
        message: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("Connection timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True for envelope violations; I/O errors and a clean EOF are not
    pub fn is_framing_fault(&self) -> bool {
        match self {
            TransportError::Frame(FrameError::Io(_) | FrameError::ConnectionClosed) => false,
            TransportError::Frame(_) => true,
            _ => false,
        }
    }
}

/// One framed duplex stream split into its send and receive sides
pub struct FrameTransport<S> {
    pub sender: FrameSender,
    pub reader: FrameReader<ReadHalf<S>>,
    pub closer: TransportCloser,
    pub writer: JoinHandle<()>,
}

impl<S> FrameTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Split `stream` and start the writer task
    pub fn new(stream: S, counter: TrafficCounter) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let closer = TransportCloser::new();
        let (sender, writer) = sender::spawn_writer(write_half, closer.clone(), counter.clone());
        let reader = FrameReader::new(read_half, closer.clone(), counter);

        Self {
            sender,
            reader,
            closer,
            writer,
        }
    }
}
