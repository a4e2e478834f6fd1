//! Frame types carried inside the wire envelope

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};

use crate::codec::FrameError;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Authorization = 1,
    AuthorizationResponse = 2,
    Registration = 3,
    RegistrationResponse = 4,
    HealthCheck = 5,
    HealthCheckResponse = 6,
    SocketData = 7,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameType::Authorization),
            2 => Ok(FrameType::AuthorizationResponse),
            3 => Ok(FrameType::Registration),
            4 => Ok(FrameType::RegistrationResponse),
            5 => Ok(FrameType::HealthCheck),
            6 => Ok(FrameType::HealthCheckResponse),
            7 => Ok(FrameType::SocketData),
            _ => Err(FrameError::UnknownFrameType(value)),
        }
    }
}

/// One logical protocol message.
///
/// `sequence` is taken from the envelope on decode; it is never serialized
/// into the frame body, so the envelope counter is the only authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub sequence: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, sequence: u64, payload: Bytes) -> Self {
        Self {
            frame_type,
            sequence,
            payload,
        }
    }

    /// Serialize the frame body: type byte followed by the payload
    pub(crate) fn encode_body(frame_type: FrameType, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + payload.len());
        buf.put_u8(frame_type as u8);
        buf.extend_from_slice(payload);
        buf.freeze()
    }

    /// Parse a frame body received under envelope sequence `sequence`
    pub(crate) fn decode_body(sequence: u64, mut body: Bytes) -> Result<Self, FrameError> {
        if body.is_empty() {
            return Err(FrameError::EmptyBody);
        }
        let frame_type = FrameType::try_from(body[0])?;
        let payload = body.split_off(1);
        Ok(Self {
            frame_type,
            sequence,
            payload,
        })
    }

    /// Deserialize the payload as a bincode message
    pub fn message<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Serialize a message into a payload suitable for `FrameEncoder::encode`
    pub fn payload_for<T: Serialize>(message: &T) -> Result<Bytes, FrameError> {
        Ok(Bytes::from(bincode::serialize(message)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_round_trip_through_u8() {
        for ty in [
            FrameType::Authorization,
            FrameType::RegistrationResponse,
            FrameType::SocketData,
        ] {
            assert_eq!(FrameType::try_from(ty as u8).unwrap(), ty);
        }
        assert!(matches!(
            FrameType::try_from(0),
            Err(FrameError::UnknownFrameType(0))
        ));
    }

    #[test]
    fn test_body_keeps_payload_bytes() {
        let body = Frame::encode_body(FrameType::HealthCheck, b"abc");
        assert_eq!(body[0], FrameType::HealthCheck as u8);

        let frame = Frame::decode_body(9, body).unwrap();
        assert_eq!(frame.frame_type, FrameType::HealthCheck);
        assert_eq!(frame.sequence, 9);
        assert_eq!(&frame.payload[..], b"abc");
    }

    #[test]
    fn test_empty_body_is_rejected() {
        assert!(matches!(
            Frame::decode_body(0, Bytes::new()),
            Err(FrameError::EmptyBody)
        ));
    }
}
