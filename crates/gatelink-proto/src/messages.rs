//! Protocol message payloads
//!
//! Each message is bincode-serialized into the payload of a frame of the
//! matching [`FrameType`](crate::FrameType).

use serde::{Deserialize, Serialize};

/// Result code carried by every gateway reply
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    Unauthorized,
    InvalidRequest,
    ServerError,
}

impl ResultCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, ResultCode::Ok)
    }
}

/// Agent credentials, sent once per session in an `Authorization` frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub agent_id: String,
    pub username: String,
    pub secret: String,
    pub agent_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizationResponse {
    pub result: ResultCode,
    #[serde(default)]
    pub message: Option<String>,
}

/// One resource rule as produced by the (external) rule loader
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRule {
    /// Human readable resource name
    pub name: String,
    /// Request pattern the gateway matches against (opaque to the agent)
    pub pattern: String,
    /// Identities allowed to reach this resource
    #[serde(default)]
    pub allowed_identities: Vec<String>,
    /// Destination host the agent will dial for this resource
    pub host: String,
    /// Destination port the agent will dial for this resource
    pub port: u16,
    /// Which clients the rule applies to (opaque to the agent)
    #[serde(default)]
    pub client_scope: Option<String>,
}

/// A resource rule paired with the secret key generated for it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredResource {
    pub rule: ResourceRule,
    pub key: u64,
}

/// Full resource manifest; replaces whatever was registered before
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub resources: Vec<RegisteredResource>,
}

/// Health-check cadence chosen by the gateway
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckSettings {
    pub interval_secs: u64,
    pub max_missed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationResponse {
    pub result: ResultCode,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSettings>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckResponse {
    pub nonce: u64,
    pub result: ResultCode,
}

/// What happened on a logical connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SocketDataKind {
    /// Open a new logical connection
    Start,
    /// Bytes for an open logical connection
    Continue(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Logical connection finished
    Close,
}

/// Payload of every `SocketData` frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SocketData {
    pub connection_id: u32,
    pub kind: SocketDataKind,
}

impl SocketData {
    pub fn start(connection_id: u32) -> Self {
        Self {
            connection_id,
            kind: SocketDataKind::Start,
        }
    }

    pub fn chunk(connection_id: u32, data: Vec<u8>) -> Self {
        Self {
            connection_id,
            kind: SocketDataKind::Continue(data),
        }
    }

    pub fn close(connection_id: u32) -> Self {
        Self {
            connection_id,
            kind: SocketDataKind::Close,
        }
    }
}

// Serialize byte vectors as a single bytes blob rather than a sequence of u8
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
