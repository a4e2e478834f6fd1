//! Gatelink agent library
//!
//! Connects to a gateway over TLS, authorizes, registers the local resource
//! manifest and then multiplexes gateway connections onto a local SOCKS5
//! listener that only admits registered destinations.

pub mod access;
pub mod agent;
pub mod config;
pub mod health;
pub mod lifecycle;
pub mod mux;
pub mod pool;
pub mod reconnect;
pub mod registration;
pub mod socks;

pub use access::{AccessError, AccessTable, Destination};
pub use agent::{Agent, AgentError};
pub use config::{AgentConfig, ConfigError};
pub use health::{HealthCheckConfig, HealthMonitor};
pub use lifecycle::{Lifecycle, LifecycleError, LifecycleState, SessionContext};
pub use mux::{MultiplexerConfig, MuxError, StreamMultiplexer, LOCAL_ID_FLAG};
pub use pool::{PoolError, WorkerPool};
pub use reconnect::{ReconnectError, ReconnectPolicy, SessionBackoff};
pub use registration::{assign_keys, ReRegistrar, RegistrarSlot};
pub use socks::{ConnectionMeta, Socks5Config, Socks5Server, SocksError};
