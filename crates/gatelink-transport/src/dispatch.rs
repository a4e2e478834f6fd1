//! Receive side of the transport

use gatelink_proto::{Frame, FrameDecoder, FrameType};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, trace, warn};

use crate::sender::{TrafficCounter, TransportCloser};
use crate::TransportError;

/// Error type handlers return to abort the session
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handles every inbound frame of one type.
///
/// Handlers run on the dispatch loop and must not block; anything slow
/// belongs in a spawned task. Returning an error ends the session.
pub trait FrameHandler: Send + Sync {
    fn handle(&self, frame: Frame) -> Result<(), HandlerError>;
}

impl<F> FrameHandler for F
where
    F: Fn(Frame) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, frame: Frame) -> Result<(), HandlerError> {
        self(frame)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("A handler for {0:?} is already registered")]
    DuplicateHandler(FrameType),
}

/// Frame type to handler map, built before dispatching starts
#[derive(Default)]
pub struct DispatchTable {
    handlers: HashMap<FrameType, Arc<dyn FrameHandler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `frame_type`. At most one per type.
    pub fn register<H>(&mut self, frame_type: FrameType, handler: H) -> Result<(), DispatchError>
    where
        H: FrameHandler + 'static,
    {
        if self.handlers.contains_key(&frame_type) {
            return Err(DispatchError::DuplicateHandler(frame_type));
        }
        self.handlers.insert(frame_type, Arc::new(handler));
        Ok(())
    }

    pub fn contains(&self, frame_type: FrameType) -> bool {
        self.handlers.contains_key(&frame_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn dispatch(&self, frame: Frame) -> Result<(), TransportError> {
        let frame_type = frame.frame_type;
        match self.handlers.get(&frame_type) {
            Some(handler) => handler
                .handle(frame)
                .map_err(|e| TransportError::Handler {
                    frame_type,
                    message: e.to_string(),
                }),
            None => {
                warn!(
                    "No handler for {:?} (sequence {}), dropping frame",
                    frame_type, frame.sequence
                );
                Ok(())
            }
        }
    }
}

/// Reads frames off the receive half of a transport
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
    closer: TransportCloser,
    counter: TrafficCounter,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, closer: TransportCloser, counter: TrafficCounter) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(),
            closer,
            counter,
        }
    }

    /// Read exactly one frame, waiting until it arrives.
    ///
    /// Used for the request/response steps before dispatching starts.
    pub async fn read_one_frame(&mut self) -> Result<Frame, TransportError> {
        let frame = tokio::select! {
            biased;
            _ = self.closer.closed() => return Err(TransportError::Aborted),
            result = self.decoder.read_frame(&mut self.reader) => result?,
        };

        self.counter.add_received(&frame);
        trace!(
            frame_type = ?frame.frame_type,
            sequence = frame.sequence,
            len = frame.payload.len(),
            "Frame received"
        );
        Ok(frame)
    }

    /// Route every inbound frame to its handler until something fails.
    ///
    /// Never returns while the transport is healthy. The returned error is
    /// whatever ended the loop: a framing fault, EOF, a failed handler, or
    /// [`TransportError::Aborted`] after [`TransportCloser::close`].
    pub async fn start_dispatching(mut self, table: DispatchTable) -> TransportError {
        debug!(handlers = table.len(), "Dispatch loop started");

        loop {
            let frame = match self.read_one_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Dispatch loop ended: {}", e);
                    return e;
                }
            };

            if let Err(e) = table.dispatch(frame) {
                debug!("Dispatch loop ended: {}", e);
                return e;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut table = DispatchTable::new();
        table
            .register(FrameType::HealthCheck, |_frame: Frame| Ok::<(), HandlerError>(()))
            .unwrap();

        let err = table
            .register(FrameType::HealthCheck, |_frame: Frame| Ok::<(), HandlerError>(()))
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::DuplicateHandler(FrameType::HealthCheck)
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unhandled_type_is_dropped() {
        let table = DispatchTable::new();
        let frame = Frame::new(FrameType::SocketData, 0, bytes::Bytes::new());
        assert!(table.dispatch(frame).is_ok());
    }

    #[test]
    fn test_handler_error_surfaces_frame_type() {
        let mut table = DispatchTable::new();
        table
            .register(FrameType::Registration, |_frame: Frame| {
                Err::<(), HandlerError>("bad manifest".into())
            })
            .unwrap();

        let frame = Frame::new(FrameType::Registration, 3, bytes::Bytes::new());
        match table.dispatch(frame) {
            Err(TransportError::Handler {
                frame_type,
                message,
            }) => {
                assert_eq!(frame_type, FrameType::Registration);
                assert_eq!(message, "bad manifest");
            }
            other => panic!("Expected handler error, got {:?}", other),
        }
    }
}
