//! Wire envelope encoding/decoding
//!
//! Envelope format (all integers big-endian):
//! ```text
//! +-----+-----------------+-----------------+-------------+------------------+
//! | '*' |  magic (8B)     |  sequence (8B)  | length (4B) | body (length B)  |
//! +-----+-----------------+-----------------+-------------+------------------+
//! ```
//!
//! The body is the serialized [`Frame`]: one type byte followed by the payload.
//! Each direction numbers its envelopes from 0 upwards; a receiver that sees
//! any other sequence fails instead of resynchronizing.

use crate::frame::{Frame, FrameType};
use crate::{HEADER_SIZE, MAGIC, MAX_FRAME_SIZE, START_MARKER};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::ErrorKind;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Framing faults. Every variant is fatal to the transport it came from.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("bad start marker: 0x{0:02x}")]
    BadStartMarker(u8),

    #[error("bad magic: {0:?}")]
    BadMagic([u8; 8]),

    #[error("bad sequence: expected {expected}, got {actual}")]
    BadSequence { expected: u64, actual: u64 },

    #[error("bad length: {0} is outside 0..=1048576")]
    BadLength(u32),

    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("frame body is empty")]
    EmptyBody,

    #[error("payload too large to frame: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("stream ended in the middle of an envelope")]
    Truncated,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sender-side envelope writer with its own monotonic sequence counter
#[derive(Debug, Default)]
pub struct FrameEncoder {
    next_sequence: u64,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next encoded frame will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Encode one frame, assigning it the next sequence number.
    ///
    /// The counter only advances when encoding succeeds.
    pub fn encode(&mut self, frame_type: FrameType, payload: &[u8]) -> Result<Bytes, FrameError> {
        let body_len = 1 + payload.len();
        if body_len > MAX_FRAME_SIZE as usize {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }

        let body = Frame::encode_body(frame_type, payload);
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
        buf.put_u8(START_MARKER);
        buf.put_slice(&MAGIC);
        buf.put_u64(self.next_sequence);
        buf.put_u32(body.len() as u32);
        buf.put(body);

        self.next_sequence += 1;
        Ok(buf.freeze())
    }

    /// Encode an already built frame. Its `sequence` field is ignored and
    /// replaced by this encoder's counter.
    pub fn encode_frame(&mut self, frame: &Frame) -> Result<Bytes, FrameError> {
        self.encode(frame.frame_type, &frame.payload)
    }
}

/// Receiver-side envelope reader tracking the expected sequence number
#[derive(Debug, Default)]
pub struct FrameDecoder {
    expected_sequence: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next envelope must carry
    pub fn expected_sequence(&self) -> u64 {
        self.expected_sequence
    }

    /// Read and validate exactly one envelope from `reader`.
    ///
    /// Returns `ConnectionClosed` if the stream ends cleanly before the first
    /// byte, and `Truncated` if it ends anywhere inside an envelope.
    pub async fn read_frame<R>(&mut self, reader: &mut R) -> Result<Frame, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut marker = [0u8; 1];
        if reader.read(&mut marker).await? == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        if marker[0] != START_MARKER {
            return Err(FrameError::BadStartMarker(marker[0]));
        }

        let mut magic = [0u8; 8];
        read_exact(reader, &mut magic).await?;
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }

        let mut sequence = [0u8; 8];
        read_exact(reader, &mut sequence).await?;
        let sequence = u64::from_be_bytes(sequence);
        if sequence != self.expected_sequence {
            return Err(FrameError::BadSequence {
                expected: self.expected_sequence,
                actual: sequence,
            });
        }
        self.expected_sequence += 1;

        let mut length = [0u8; 4];
        read_exact(reader, &mut length).await?;
        let length = u32::from_be_bytes(length);
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::BadLength(length));
        }

        let mut body = vec![0u8; length as usize];
        read_exact(reader, &mut body).await?;

        Frame::decode_body(sequence, Bytes::from(body))
    }
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(FrameError::Truncated),
        Err(e) => Err(FrameError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_assigns_increasing_sequences() {
        let mut encoder = FrameEncoder::new();
        let first = encoder.encode(FrameType::HealthCheck, b"a").unwrap();
        let second = encoder.encode(FrameType::HealthCheck, b"b").unwrap();

        assert_eq!(&first[9..17], &0u64.to_be_bytes());
        assert_eq!(&second[9..17], &1u64.to_be_bytes());
        assert_eq!(encoder.next_sequence(), 2);
    }

    #[test]
    fn test_envelope_layout() {
        let mut encoder = FrameEncoder::new();
        let bytes = encoder.encode(FrameType::SocketData, b"xyz").unwrap();

        assert_eq!(bytes[0], b'*');
        assert_eq!(&bytes[1..9], b"BEEFCAKE");
        assert_eq!(&bytes[17..21], &4u32.to_be_bytes());
        assert_eq!(bytes[21], FrameType::SocketData as u8);
        assert_eq!(&bytes[22..], b"xyz");
        assert_eq!(bytes.len(), HEADER_SIZE + 4);
    }

    #[test]
    fn test_oversized_payload_does_not_consume_sequence() {
        let mut encoder = FrameEncoder::new();
        let payload = vec![0u8; MAX_FRAME_SIZE as usize];

        let result = encoder.encode(FrameType::SocketData, &payload);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge(_))));
        assert_eq!(encoder.next_sequence(), 0);
    }

    #[tokio::test]
    async fn test_decode_partial_reads() {
        let mut encoder = FrameEncoder::new();
        let bytes = encoder.encode(FrameType::Registration, &[7u8; 300]).unwrap();

        // Deliver the envelope a few bytes at a time
        let (mut client, mut server) = tokio::io::duplex(5);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in bytes.chunks(3) {
                client.write_all(chunk).await.unwrap();
            }
        });

        let mut decoder = FrameDecoder::new();
        let frame = decoder.read_frame(&mut server).await.unwrap();
        writer.await.unwrap();

        assert_eq!(frame.frame_type, FrameType::Registration);
        assert_eq!(frame.payload.len(), 300);
        assert_eq!(decoder.expected_sequence(), 1);
    }

    #[tokio::test]
    async fn test_clean_eof_is_connection_closed() {
        let mut decoder = FrameDecoder::new();
        let mut empty: &[u8] = &[];
        assert!(matches!(
            decoder.read_frame(&mut empty).await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let mut encoder = FrameEncoder::new();
        let bytes = encoder.encode(FrameType::HealthCheck, b"0123456789").unwrap();
        let mut cut: &[u8] = &bytes[..bytes.len() - 4];

        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.read_frame(&mut cut).await,
            Err(FrameError::Truncated)
        ));
    }
}
