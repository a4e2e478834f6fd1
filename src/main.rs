//! Gatelink Agent - secure tunnel agent CLI
//!
//! Connects to a gateway over TLS, registers the resources this host may
//! reach, and serves gateway connections through a local SOCKS5 listener.

use anyhow::{Context, Result};
use clap::Parser;
use gatelink_agent::{Agent, AgentConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

/// Gatelink tunnel agent - exposes registered resources to a gateway
#[derive(Parser, Debug)]
#[command(name = "gatelink")]
#[command(about = "Gatelink tunnel agent - exposes registered resources to a gateway")]
#[command(version)]
#[command(long_about = r#"
Gatelink Agent connects to a gateway over TLS, authorizes, registers the
resources listed in its configuration and forwards gateway connections to
them through a local SOCKS5 listener.

EXAMPLES:
  # Start agent using config file
  gatelink --config agent.yaml

  # Override the gateway and credentials from the environment
  GATELINK_GATEWAY=gw.example.com:8443 GATELINK_SECRET=$SECRET \
    gatelink --config agent.yaml --log-level debug

On Unix, SIGHUP re-reads the configuration file and re-registers its
resources with fresh keys without dropping the session.

ENVIRONMENT VARIABLES:
  GATELINK_GATEWAY     Gateway address (host:port)
  GATELINK_USERNAME    Gateway username
  GATELINK_SECRET      Gateway secret
  GATELINK_AGENT_ID    Agent identifier
"#)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Gateway address (e.g., gw.example.com:8443)
    #[arg(long, env = "GATELINK_GATEWAY")]
    gateway: Option<String>,

    /// Gateway username
    #[arg(long, env = "GATELINK_USERNAME")]
    username: Option<String>,

    /// Gateway secret
    #[arg(long, env = "GATELINK_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Agent ID (auto-generated if not specified)
    #[arg(long, env = "GATELINK_AGENT_ID")]
    agent_id: Option<String>,

    /// SOCKS5 listen address (e.g., 127.0.0.1:1080)
    #[arg(long)]
    socks_listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &Path) -> Result<AgentConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: AgentConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Split `host:port`
fn parse_address(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("Invalid gateway address '{}' (expected host:port)", addr))?;

    if host.is_empty() {
        anyhow::bail!("Invalid gateway address '{}' (host cannot be empty)", addr);
    }

    let port = port
        .parse::<u16>()
        .with_context(|| format!("Invalid port in gateway address: {}", addr))?;

    Ok((host.to_string(), port))
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_agent_config(args: &Args) -> Result<AgentConfig> {
    info!("Loading configuration from: {}", args.config.display());
    let mut config = load_config_file(&args.config)?;

    if let Some(gateway) = &args.gateway {
        let (host, port) = parse_address(gateway)?;
        config.gateway.host = host;
        config.gateway.port = port;
    }
    if let Some(username) = &args.username {
        config.credentials.username = username.clone();
    }
    if let Some(secret) = &args.secret {
        config.credentials.secret = secret.clone();
    }
    if let Some(listen) = &args.socks_listen {
        config.socks.listen_addr = listen.clone();
    }
    if args.insecure {
        config.tls.insecure = true;
    }

    if let Some(agent_id) = &args.agent_id {
        config.agent_id = agent_id.clone();
    }
    if config.agent_id.is_empty() {
        config.agent_id = format!("agent-{}", Uuid::new_v4());
        info!("Auto-generated agent ID: {}", config.agent_id);
    }

    Ok(config)
}

/// Re-read the resource list on SIGHUP and register it on the live session
#[cfg(unix)]
fn spawn_reload_handler(agent: Arc<Agent>, path: PathBuf) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("Received SIGHUP, reloading resources");
            match load_config_file(&path) {
                Ok(config) => agent.reregister(config.resources),
                Err(e) => error!("Reload failed: {:#}", e),
            }
        }
    });

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Setup logging first
    setup_logging(&args.log_level)?;

    info!("Gatelink Agent starting...");

    let config = build_agent_config(&args).context("Failed to build agent configuration")?;

    // Log configuration (but not the secret)
    info!("Agent ID: {}", config.agent_id);
    info!(
        "Gateway: {}:{}",
        config.gateway.host, config.gateway.port
    );
    info!("SOCKS5 listener: {}", config.socks.listen_addr);
    info!("Resources: {}", config.resources.len());

    let agent = Arc::new(Agent::new(config).context("Failed to create agent")?);

    #[cfg(unix)]
    spawn_reload_handler(agent.clone(), args.config.clone())?;

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let runner = agent.clone();
    let agent_task = tokio::spawn(async move { runner.run().await });
    tokio::pin!(agent_task);

    // Wait for Ctrl+C or agent exit
    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            agent.shutdown();
            match agent_task.await {
                Ok(Err(e)) => error!("Agent error during shutdown: {:#}", e),
                Err(e) => error!("Agent task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = &mut agent_task => {
            match result {
                Ok(Ok(())) => {
                    info!("Agent stopped normally");
                }
                Ok(Err(e)) => {
                    error!("Agent error: {:#}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Agent task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    let traffic = agent.traffic();
    info!(
        sent = traffic.bytes_sent(),
        received = traffic.bytes_received(),
        "Agent stopped"
    );
    Ok(())
}
