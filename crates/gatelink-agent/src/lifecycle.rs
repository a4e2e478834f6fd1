//! Connection lifecycle state machine
//!
//! One [`Lifecycle`] drives one session with the gateway:
//!
//! ```text
//! Init -> TlsConnected -> HandshakeSent -> Authorized -> Registered -> Dispatching
//!   \_____________\______________\______________\____________\______-> Closed | Failed
//! ```
//!
//! Every step before `Dispatching` is a strict request/response exchange
//! over `read_one_frame`. Once dispatching starts, the session lasts until
//! the transport fails or is closed; closing the transport is the only way
//! a session is ended from the inside or the outside.

use gatelink_proto::{
    AuthorizationRequest, AuthorizationResponse, Frame, FrameError, FrameType,
    RegistrationRequest, RegistrationResponse, ResourceRule, PROTOCOL_PREAMBLE,
};
use gatelink_transport::{
    DispatchError, DispatchTable, FrameReader, FrameSender, FrameTransport, GatewayConnector,
    GatewayStream, TrafficCounter, TransportCloser, TransportError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::access::AccessTable;
use crate::config::AgentConfig;
use crate::health::{HealthCheckConfig, HealthMonitor};
use crate::mux::{MultiplexerConfig, StreamMultiplexer};
use crate::pool::WorkerPool;
use crate::registration::{assign_keys, ReRegistrar, RegistrarSlot};

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    TlsConnected,
    HandshakeSent,
    Authorized,
    Registered,
    Dispatching,
    Closed,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Closed | LifecycleState::Failed)
    }

    fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, next) {
            (Init, TlsConnected)
            | (TlsConnected, HandshakeSent)
            | (HandshakeSent, Authorized)
            | (Authorized, Registered)
            | (Registered, Dispatching) => true,
            (from, Closed | Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Why a session ended
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Failed to connect to gateway: {0}")]
    Connect(String),

    #[error("Framing fault: {0}")]
    Framing(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("No successful health check within {0:?}")]
    HealthCheck(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport closed locally")]
    Closed,

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

impl LifecycleError {
    /// The gateway refused our credentials; retrying will not help
    pub fn is_credential_fault(&self) -> bool {
        matches!(self, LifecycleError::Authentication(_))
    }

    pub fn is_framing_fault(&self) -> bool {
        matches!(self, LifecycleError::Framing(_))
    }
}

impl From<TransportError> for LifecycleError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Aborted => LifecycleError::Closed,
            TransportError::Frame(FrameError::ConnectionClosed) => {
                LifecycleError::Transport("gateway closed the connection".to_string())
            }
            TransportError::Frame(FrameError::Io(e)) => LifecycleError::Transport(e.to_string()),
            TransportError::Frame(e) => LifecycleError::Framing(e.to_string()),
            TransportError::Tls(msg) => LifecycleError::Tls(msg),
            TransportError::InvalidServerName(msg) => LifecycleError::Tls(msg),
            other => LifecycleError::Transport(other.to_string()),
        }
    }
}

impl From<DispatchError> for LifecycleError {
    fn from(e: DispatchError) -> Self {
        LifecycleError::Transport(e.to_string())
    }
}

/// State shared by every session of one agent
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<AgentConfig>,
    pub access: Arc<AccessTable>,
    pub rules: Arc<RwLock<Vec<ResourceRule>>>,
    pub pool: WorkerPool,
    pub multiplexer: MultiplexerConfig,
    pub liveness: Arc<AtomicBool>,
    pub counter: TrafficCounter,
    pub registrar: RegistrarSlot,
    pub shutdown: CancellationToken,
}

impl SessionContext {
    /// Fresh shared state for `config`, dialing `local_target` for gateway
    /// connections
    pub fn new(config: AgentConfig, local_target: &str) -> Self {
        let rules = config.resources.clone();
        Self {
            access: Arc::new(AccessTable::new()),
            rules: Arc::new(RwLock::new(rules)),
            pool: config.worker_pool(),
            multiplexer: config.multiplexer_config(local_target),
            liveness: Arc::new(AtomicBool::new(false)),
            counter: TrafficCounter::new(),
            registrar: RegistrarSlot::default(),
            shutdown: CancellationToken::new(),
            config: Arc::new(config),
        }
    }

    /// The manifest the next registration will send
    pub fn current_rules(&self) -> Vec<ResourceRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Closes the transport however the session ends
struct CloseOnDrop(TransportCloser);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// One session with the gateway
pub struct Lifecycle {
    ctx: SessionContext,
    state: LifecycleState,
    reached_dispatching: bool,
}

impl Lifecycle {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            state: LifecycleState::Init,
            reached_dispatching: false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Whether this session ever got as far as dispatching
    pub fn reached_dispatching(&self) -> bool {
        self.reached_dispatching
    }

    fn transition(&mut self, next: LifecycleState) -> Result<(), LifecycleError> {
        if !self.state.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(from = ?self.state, to = ?next, "Lifecycle transition");
        self.state = next;
        Ok(())
    }

    /// Connect to the configured gateway over TLS and run the session
    pub async fn run(&mut self) -> Result<(), LifecycleError> {
        if self.state != LifecycleState::Init {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                to: LifecycleState::TlsConnected,
            });
        }

        match self.connect().await {
            Ok(stream) => self.run_over(stream).await,
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<GatewayStream, LifecycleError> {
        let config = &self.ctx.config;
        let settings = config
            .tls_settings()
            .map_err(|e| LifecycleError::Tls(e.to_string()))?;
        let connector = GatewayConnector::new(&config.gateway.host, config.gateway.port, &settings)
            .map_err(LifecycleError::from)?;

        connector.connect().await.map_err(|e| match e {
            TransportError::Tls(msg) | TransportError::InvalidServerName(msg) => {
                LifecycleError::Tls(msg)
            }
            other => LifecycleError::Connect(other.to_string()),
        })
    }

    /// Run the session over an already established stream
    pub async fn run_over<S>(&mut self, stream: S) -> Result<(), LifecycleError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let result = match self.drive(stream).await {
            Err(LifecycleError::Closed) if self.ctx.shutdown.is_cancelled() => Ok(()),
            other => other,
        };

        self.ctx.liveness.store(false, Ordering::Relaxed);
        match &result {
            Ok(()) => {
                self.transition(LifecycleState::Closed)?;
                info!("Session closed");
            }
            Err(e) => self.fail(e),
        }
        result
    }

    fn fail(&mut self, e: &LifecycleError) {
        if self.state.is_terminal() {
            return;
        }
        warn!(state = ?self.state, "Session failed: {}", e);
        self.state = LifecycleState::Failed;
    }

    async fn drive<S>(&mut self, mut stream: S) -> Result<(), LifecycleError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.transition(LifecycleState::TlsConnected)?;

        stream
            .write_all(PROTOCOL_PREAMBLE)
            .await
            .map_err(|e| LifecycleError::Transport(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| LifecycleError::Transport(e.to_string()))?;
        self.transition(LifecycleState::HandshakeSent)?;

        let FrameTransport {
            sender,
            mut reader,
            closer,
            writer: _writer,
        } = FrameTransport::new(stream, self.ctx.counter.clone());
        let _close_on_drop = CloseOnDrop(closer.clone());

        // Agent shutdown closes the transport, wherever the session is
        let shutdown = self.ctx.shutdown.clone();
        let watcher_closer = closer.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => watcher_closer.close(),
                _ = watcher_closer.closed() => {}
            }
        });

        self.authorize(&sender, &mut reader).await?;
        let health = self.register(&sender, &mut reader).await?;
        self.dispatch(sender, reader, closer, health).await
    }

    async fn authorize<R>(
        &mut self,
        sender: &FrameSender,
        reader: &mut FrameReader<R>,
    ) -> Result<(), LifecycleError>
    where
        R: AsyncRead + Unpin,
    {
        let config = &self.ctx.config;
        let request = AuthorizationRequest {
            agent_id: config.agent_id.clone(),
            username: config.credentials.username.clone(),
            secret: config.credentials.secret.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        sender.send_message(FrameType::Authorization, &request)?;

        let reply = reader.read_one_frame().await?;
        let response: AuthorizationResponse =
            expect_reply(&reply, FrameType::AuthorizationResponse)
                .map_err(LifecycleError::Authentication)?;

        if !response.result.is_ok() {
            return Err(LifecycleError::Authentication(format!(
                "gateway answered {:?}: {}",
                response.result,
                response.message.unwrap_or_default()
            )));
        }

        self.transition(LifecycleState::Authorized)?;
        info!(agent_id = %self.ctx.config.agent_id, "Authorized by gateway");
        Ok(())
    }

    async fn register<R>(
        &mut self,
        sender: &FrameSender,
        reader: &mut FrameReader<R>,
    ) -> Result<HealthCheckConfig, LifecycleError>
    where
        R: AsyncRead + Unpin,
    {
        let resources = assign_keys(&self.ctx.current_rules());
        let request = RegistrationRequest {
            resources: resources.clone(),
        };
        sender.send_message(FrameType::Registration, &request)?;

        let reply = reader.read_one_frame().await?;
        let response: RegistrationResponse =
            expect_reply(&reply, FrameType::RegistrationResponse)
                .map_err(LifecycleError::Registration)?;

        if !response.result.is_ok() {
            return Err(LifecycleError::Registration(format!(
                "gateway answered {:?}: {}",
                response.result,
                response.message.unwrap_or_default()
            )));
        }

        self.ctx.access.replace_from(&resources);
        let health = match response.health_check {
            Some(settings) => HealthCheckConfig::from_settings(settings),
            None => self.ctx.config.health_check_config(),
        };

        self.transition(LifecycleState::Registered)?;
        info!(resources = resources.len(), "Resources registered");
        Ok(health)
    }

    async fn dispatch<R>(
        &mut self,
        sender: FrameSender,
        reader: FrameReader<R>,
        closer: TransportCloser,
        health: HealthCheckConfig,
    ) -> Result<(), LifecycleError>
    where
        R: AsyncRead + Unpin,
    {
        let mux = StreamMultiplexer::new(
            sender.clone(),
            self.ctx.pool.clone(),
            self.ctx.multiplexer.clone(),
        );
        let registrar = ReRegistrar::new(sender.clone(), self.ctx.access.clone());
        let monitor = HealthMonitor::new(sender, health, self.ctx.liveness.clone());

        let mut table = DispatchTable::new();
        let handler = registrar.clone();
        table.register(FrameType::RegistrationResponse, move |frame: Frame| {
            handler.handle_response(frame)
        })?;
        let handler = monitor.clone();
        table.register(FrameType::HealthCheck, move |frame: Frame| {
            handler.handle_request(frame)
        })?;
        let handler = monitor.clone();
        table.register(FrameType::HealthCheckResponse, move |frame: Frame| {
            handler.handle_response(frame)
        })?;
        let handler = mux.clone();
        table.register(FrameType::SocketData, move |frame: Frame| {
            handler.handle_frame(frame)
        })?;

        self.ctx.registrar.set(Some(registrar));
        self.transition(LifecycleState::Dispatching)?;
        self.reached_dispatching = true;
        info!(
            health_interval = ?health.interval,
            "Tunnel established, dispatching"
        );

        let health_failed = Arc::new(AtomicBool::new(false));
        let monitor_task = {
            let failed = health_failed.clone();
            monitor.spawn(move || {
                failed.store(true, Ordering::SeqCst);
                closer.close();
            })
        };

        let ended = reader.start_dispatching(table).await;

        monitor_task.abort();
        mux.shutdown();
        self.ctx.registrar.set(None);

        if health_failed.load(Ordering::SeqCst) {
            return Err(LifecycleError::HealthCheck(health.deadline()));
        }
        Err(ended.into())
    }
}

/// Check the type of a handshake reply and decode it
fn expect_reply<T>(frame: &Frame, expected: FrameType) -> Result<T, String>
where
    T: serde::de::DeserializeOwned,
{
    if frame.frame_type != expected {
        return Err(format!(
            "expected {:?}, got {:?}",
            expected, frame.frame_type
        ));
    }
    frame
        .message()
        .map_err(|e| format!("malformed {:?}: {}", expected, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path_is_linear() {
        use LifecycleState::*;
        let path = [Init, TlsConnected, HandshakeSent, Authorized, Registered, Dispatching];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
            assert!(!pair[1].can_transition_to(pair[0]));
        }
        assert!(!Init.can_transition_to(Authorized));
        assert!(!Registered.can_transition_to(HandshakeSent));
    }

    #[test]
    fn test_terminal_states() {
        use LifecycleState::*;
        assert!(Dispatching.can_transition_to(Closed));
        assert!(Dispatching.can_transition_to(Failed));
        assert!(HandshakeSent.can_transition_to(Failed));
        assert!(!Closed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Init));
    }

    #[test]
    fn test_transport_errors_keep_their_category() {
        let framing: LifecycleError =
            TransportError::Frame(FrameError::BadLength(13_434_343)).into();
        assert!(framing.is_framing_fault());

        let closed: LifecycleError = TransportError::Frame(FrameError::ConnectionClosed).into();
        assert!(matches!(closed, LifecycleError::Transport(_)));

        let aborted: LifecycleError = TransportError::Aborted.into();
        assert!(matches!(aborted, LifecycleError::Closed));

        assert!(LifecycleError::Authentication("no".into()).is_credential_fault());
        assert!(!LifecycleError::Registration("no".into()).is_credential_fault());
    }
}
