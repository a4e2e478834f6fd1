//! Agent configuration
//!
//! Plain data, deserializable from the YAML file the binary loads. Resource
//! rules arrive here already validated; the agent does not interpret their
//! patterns or identities.

use gatelink_proto::ResourceRule;
use gatelink_transport::{load_ca_certificates, TlsSettings, TransportError};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::health::HealthCheckConfig;
use crate::mux::MultiplexerConfig;
use crate::pool::WorkerPool;
use crate::reconnect::ReconnectPolicy;
use crate::socks::Socks5Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to load TLS material: {0}")]
    Tls(#[from] TransportError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8443,
        }
    }
}

#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM bundle with the gateway's CA; the webpki roots when absent
    pub ca_cert_path: Option<PathBuf>,
    /// Skip certificate verification (INSECURE, development only)
    pub insecure: bool,
    pub connect_timeout_secs: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: None,
            insecure: false,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultiplexerSettings {
    /// Where gateway connections are dialed; the SOCKS listener when absent
    pub local_target: Option<String>,
    pub buffer_size: usize,
    pub pool_capacity: usize,
    pub retry_attempts: u32,
    pub retry_interval_ms: u64,
    pub connect_timeout_secs: u64,
}

impl Default for MultiplexerSettings {
    fn default() -> Self {
        Self {
            local_target: None,
            buffer_size: 16 * 1024,
            pool_capacity: 512,
            retry_attempts: 5,
            retry_interval_ms: 200,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckSection {
    pub interval_secs: u64,
    pub max_missed: u32,
}

impl Default for HealthCheckSection {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_missed: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub multiplier: f64,
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1000,
            max_backoff_secs: 60,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Everything one agent needs to run
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent_id: String,
    pub gateway: GatewayConfig,
    pub credentials: Credentials,
    pub tls: TlsConfig,
    pub socks: Socks5Config,
    pub multiplexer: MultiplexerSettings,
    pub health_check: HealthCheckSection,
    pub reconnect: ReconnectSection,
    pub resources: Vec<ResourceRule>,
}

impl AgentConfig {
    /// Check the fields the agent cannot run without
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.is_empty() {
            return Err(ConfigError::Invalid("agent_id is required".to_string()));
        }
        if self.gateway.host.is_empty() {
            return Err(ConfigError::Invalid("gateway.host is required".to_string()));
        }
        if self.gateway.port == 0 {
            return Err(ConfigError::Invalid("gateway.port must be > 0".to_string()));
        }
        if self.credentials.username.is_empty() {
            return Err(ConfigError::Invalid(
                "credentials.username is required".to_string(),
            ));
        }
        if self.multiplexer.pool_capacity < 2 {
            return Err(ConfigError::Invalid(
                "multiplexer.pool_capacity must be at least 2".to_string(),
            ));
        }
        if self.multiplexer.buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "multiplexer.buffer_size must be > 0".to_string(),
            ));
        }
        if self.health_check.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "health_check.interval_secs must be > 0".to_string(),
            ));
        }
        let multiplier = self.reconnect.multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "reconnect.multiplier must be a finite number >= 1.0, got {}",
                multiplier
            )));
        }
        for rule in &self.resources {
            if rule.host.is_empty() || rule.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "resource '{}' needs a destination host and port",
                    rule.name
                )));
            }
        }
        Ok(())
    }

    /// Client TLS settings, reading the CA bundle if one is configured
    pub fn tls_settings(&self) -> Result<TlsSettings, ConfigError> {
        let ca_certificates = match &self.tls.ca_cert_path {
            Some(path) => load_ca_certificates(path)?,
            None => Vec::new(),
        };

        Ok(TlsSettings {
            ca_certificates,
            insecure: self.tls.insecure,
            connect_timeout: Duration::from_secs(self.tls.connect_timeout_secs),
        })
    }

    /// Multiplexer settings; `socks_addr` is used when no explicit target is set
    pub fn multiplexer_config(&self, socks_addr: &str) -> MultiplexerConfig {
        MultiplexerConfig {
            local_target: self
                .multiplexer
                .local_target
                .clone()
                .unwrap_or_else(|| socks_addr.to_string()),
            buffer_size: self.multiplexer.buffer_size,
            connect_timeout: Duration::from_secs(self.multiplexer.connect_timeout_secs),
        }
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.multiplexer.pool_capacity,
            self.multiplexer.retry_attempts,
            Duration::from_millis(self.multiplexer.retry_interval_ms),
        )
    }

    /// Local health-check defaults, used until the gateway sends its own
    pub fn health_check_config(&self) -> HealthCheckConfig {
        HealthCheckConfig::from_parts(
            self.health_check.interval_secs,
            self.health_check.max_missed,
        )
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_backoff: Duration::from_millis(self.reconnect.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.reconnect.max_backoff_secs),
            multiplier: self.reconnect.multiplier,
            max_attempts: self.reconnect.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AgentConfig {
        AgentConfig {
            agent_id: "agent-1".to_string(),
            gateway: GatewayConfig {
                host: "gateway.example.com".to_string(),
                port: 8443,
            },
            credentials: Credentials {
                username: "ops".to_string(),
                secret: "hunter2".to_string(),
            },
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_missing_gateway_host() {
        let mut config = valid();
        config.gateway.host.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_pool_too_small_for_one_connection() {
        let mut config = valid();
        config.multiplexer.pool_capacity = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_multiplier_must_grow() {
        for multiplier in [-1.0, 0.5, f64::NAN, f64::INFINITY] {
            let mut config = valid();
            config.reconnect.multiplier = multiplier;
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "multiplier {} accepted",
                multiplier
            );
        }

        let mut config = valid();
        config.reconnect.multiplier = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_local_health_interval_is_capped() {
        let mut config = valid();
        config.health_check.interval_secs = u64::MAX;
        assert!(config.validate().is_ok());
        let health = config.health_check_config();
        assert_eq!(
            health.interval,
            Duration::from_secs(crate::health::MAX_INTERVAL_SECS)
        );
    }

    #[test]
    fn test_secret_is_not_logged() {
        let rendered = format!("{:?}", valid().credentials);
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_local_target_defaults_to_socks_listener() {
        let config = valid();
        assert_eq!(
            config.multiplexer_config("127.0.0.1:1080").local_target,
            "127.0.0.1:1080"
        );
    }

    #[test]
    fn test_yaml_sections() {
        let yaml = r#"
agent_id: edge-7
gateway:
  host: gw.example.net
  port: 9443
credentials:
  username: edge
  secret: s3cret
socks:
  listen_addr: "127.0.0.1:1999"
health_check:
  interval_secs: 5
resources:
  - name: db
    pattern: "db.*"
    host: 10.0.0.5
    port: 5432
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.port, 9443);
        assert_eq!(config.socks.listen_addr, "127.0.0.1:1999");
        assert_eq!(config.health_check.interval_secs, 5);
        assert_eq!(config.health_check.max_missed, 3);
        assert_eq!(config.resources.len(), 1);
        assert_eq!(config.resources[0].allowed_identities, Vec::<String>::new());
    }
}
