//! Gatelink Protocol Definitions
//!
//! This crate defines the wire envelope, frame types and message payloads
//! exchanged between a gatelink agent and its gateway.

pub mod codec;
pub mod frame;
pub mod messages;

pub use codec::{FrameDecoder, FrameEncoder, FrameError};
pub use frame::{Frame, FrameType};
pub use messages::*;

/// Plaintext line written right after TLS is established, before any framing
pub const PROTOCOL_PREAMBLE: &[u8] = b"GATELINK/1.0\n";

/// First byte of every envelope
pub const START_MARKER: u8 = b'*';

/// Fixed envelope magic following the start marker
pub const MAGIC: [u8; 8] = *b"BEEFCAKE";

/// Envelope header size: marker (1) + magic (8) + sequence (8) + length (4)
pub const HEADER_SIZE: usize = 1 + 8 + 8 + 4;

/// Maximum envelope payload size (1 MiB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;
