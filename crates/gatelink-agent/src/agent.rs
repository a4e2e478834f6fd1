use crate::access::AccessTable;
use crate::config::{AgentConfig, ConfigError};
use crate::lifecycle::{Lifecycle, LifecycleError, SessionContext};
use crate::reconnect::{ReconnectError, SessionBackoff};
use crate::socks::{Socks5Server, SocksError};
use gatelink_proto::ResourceRule;
use gatelink_transport::TrafficCounter;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Errors that stop the agent for good
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("SOCKS5 server error: {0}")]
    Socks(#[from] SocksError),

    #[error("Session error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Reconnection error: {0}")]
    Reconnect(ReconnectError),
}

/// The gatelink agent - serves SOCKS5 locally and keeps a session with the gateway
pub struct Agent {
    config: AgentConfig,

    /// Access table shared by every session and the SOCKS5 listener
    access: Arc<AccessTable>,

    /// True while a session is dispatching and healthy
    liveness: Arc<AtomicBool>,

    /// Bytes exchanged with the gateway across all sessions
    counter: TrafficCounter,

    /// Current resource manifest, registered by every new session
    rules: Arc<RwLock<Vec<ResourceRule>>>,

    /// Cancelled to stop the agent
    shutdown: CancellationToken,

    /// Set once `run` has built the session state
    context: OnceLock<SessionContext>,
}

impl Agent {
    /// Create a new agent with the given configuration
    ///
    /// # Arguments
    /// * `config` - Agent configuration
    ///
    /// # Returns
    /// Result with Agent or error if the configuration is invalid
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;

        Ok(Self {
            rules: Arc::new(RwLock::new(config.resources.clone())),
            config,
            access: Arc::new(AccessTable::new()),
            liveness: Arc::new(AtomicBool::new(false)),
            counter: TrafficCounter::new(),
            shutdown: CancellationToken::new(),
            context: OnceLock::new(),
        })
    }

    pub fn access_table(&self) -> Arc<AccessTable> {
        self.access.clone()
    }

    /// Shared flag, true while the gateway session is healthy
    pub fn liveness(&self) -> Arc<AtomicBool> {
        self.liveness.clone()
    }

    pub fn is_live(&self) -> bool {
        self.liveness.load(Ordering::Relaxed)
    }

    pub fn traffic(&self) -> TrafficCounter {
        self.counter.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the agent; the running session closes its transport
    pub fn shutdown(&self) {
        info!("Agent shutdown requested");
        self.shutdown.cancel();
    }

    /// The manifest the next registration will send
    pub fn resources(&self) -> Vec<ResourceRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the resource manifest.
    ///
    /// The new rules are kept for every later session. When a session is
    /// dispatching they are also registered on it right away with fresh keys.
    pub fn reregister(&self, rules: Vec<ResourceRule>) {
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = rules.clone();

        let registrar = self.context.get().and_then(|ctx| ctx.registrar.current());
        match registrar {
            Some(registrar) => {
                if let Err(e) = registrar.reregister(&rules) {
                    warn!("Failed to send re-registration: {}", e);
                }
            }
            None => {
                info!("No live session; manifest applies at next registration");
            }
        }
    }

    /// Run the agent until shutdown or a fatal error
    ///
    /// Binds the SOCKS5 listener, then connects to the gateway and reconnects
    /// with backoff whenever a session ends.
    pub async fn run(&self) -> Result<(), AgentError> {
        let socks = Socks5Server::bind(self.config.socks.clone(), self.access.clone()).await?;
        let local_target = dial_address(socks.local_addr().map_err(SocksError::Io)?);

        let ctx = self.context.get_or_init(|| SessionContext {
            access: self.access.clone(),
            rules: self.rules.clone(),
            liveness: self.liveness.clone(),
            counter: self.counter.clone(),
            shutdown: self.shutdown.clone(),
            ..SessionContext::new(self.config.clone(), &local_target.to_string())
        });

        info!(
            agent_id = %self.config.agent_id,
            gateway = %format!("{}:{}", self.config.gateway.host, self.config.gateway.port),
            resources = self.config.resources.len(),
            "Starting agent"
        );

        let socks_shutdown = self.shutdown.child_token();
        let socks_task = tokio::spawn(socks.run(socks_shutdown.clone()));

        let result = self.session_loop(ctx).await;

        socks_shutdown.cancel();
        ctx.pool.close();
        match socks_task.await {
            Ok(Err(e)) => warn!("SOCKS5 server stopped with error: {}", e),
            Err(e) => warn!("SOCKS5 server task failed: {}", e),
            Ok(Ok(())) => {}
        }

        result
    }

    async fn session_loop(&self, ctx: &SessionContext) -> Result<(), AgentError> {
        let mut backoff = SessionBackoff::new(self.config.reconnect_policy());

        loop {
            let mut session = Lifecycle::new(ctx.clone());
            let result = session.run().await;

            if session.reached_dispatching() {
                backoff.reset();
            }

            match result {
                Ok(()) => {
                    info!("Agent stopped");
                    return Ok(());
                }
                Err(e) if e.is_credential_fault() => {
                    error!("Gateway rejected credentials: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    if self.shutdown.is_cancelled() {
                        return Ok(());
                    }
                    warn!("Session ended: {}", e);
                }
            }

            match backoff.wait(&self.shutdown).await {
                Ok(()) => {}
                Err(ReconnectError::Cancelled) => return Ok(()),
                Err(e) => return Err(AgentError::Reconnect(e)),
            }
        }
    }
}

/// Address the multiplexer dials to reach our own listener
fn dial_address(bound: SocketAddr) -> SocketAddr {
    match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), bound.port())
        }
        _ => bound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_address_maps_wildcard_to_loopback() {
        let bound: SocketAddr = "0.0.0.0:1080".parse().unwrap();
        assert_eq!(dial_address(bound), "127.0.0.1:1080".parse().unwrap());

        let bound: SocketAddr = "[::]:1080".parse().unwrap();
        assert_eq!(dial_address(bound), "[::1]:1080".parse().unwrap());

        let bound: SocketAddr = "10.1.2.3:1080".parse().unwrap();
        assert_eq!(dial_address(bound), bound);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(matches!(
            Agent::new(AgentConfig::default()),
            Err(AgentError::Config(_))
        ));
    }
}
