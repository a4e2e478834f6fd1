//! SOCKS5 front-end (RFC 1928 CONNECT, RFC 1929 username/password)
//!
//! The password is a resource key in decimal. The username may carry
//! `key=value;key=value` metadata describing the client connection; it is
//! only used for log lines and never affects the access decision.

use serde::Deserialize;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::access::{AccessError, AccessTable, Destination};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_USERNAME_PASSWORD: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Reply {
    Succeeded = 0x00,
    ConnectionNotAllowed = 0x02,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Socks5Config {
    /// Address the SOCKS5 listener binds to
    pub listen_addr: String,
    /// Limit for dialing an allowed destination
    pub connect_timeout_secs: u64,
    /// Limit for the greeting, authentication and request phase
    pub handshake_timeout_secs: u64,
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:1080".to_string(),
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidVersion(u8),

    #[error("Client offered no username/password authentication")]
    NoAcceptableMethod,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Access denied: {0}")]
    Access(#[from] AccessError),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("Failed to connect to {destination}: {reason}")]
    ConnectFailed {
        destination: Destination,
        reason: String,
    },

    #[error("Handshake timed out")]
    Timeout,
}

/// Optional client metadata carried in the SOCKS username
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMeta(Vec<(String, String)>);

impl ConnectionMeta {
    /// Parse `k=v;k=v`. Returns `None` for anything malformed.
    pub fn parse(username: &str) -> Option<Self> {
        if username.is_empty() {
            return Some(Self::default());
        }

        let mut pairs = Vec::new();
        for part in username.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            pairs.push((key.to_string(), value.to_string()));
        }
        Some(Self(pairs))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for ConnectionMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

/// SOCKS5 server gated by the access table
pub struct Socks5Server {
    listener: TcpListener,
    access: Arc<AccessTable>,
    config: Socks5Config,
}

impl Socks5Server {
    pub async fn bind(config: Socks5Config, access: Arc<AccessTable>) -> Result<Self, SocksError> {
        let listener = TcpListener::bind(config.listen_addr.as_str()).await?;
        info!("SOCKS5 server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            access,
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SocksError> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("SOCKS5 server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted?,
            };

            let access = self.access.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, access, config).await {
                    debug!(peer = %peer, "SOCKS5 connection ended: {}", e);
                }
            });
        }
    }
}

struct Handshake {
    key: u64,
    meta: Option<ConnectionMeta>,
    destination: Destination,
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    access: Arc<AccessTable>,
    config: Socks5Config,
) -> Result<(), SocksError> {
    let negotiated = tokio::time::timeout(
        Duration::from_secs(config.handshake_timeout_secs),
        negotiate(&mut stream, &access),
    )
    .await
    .map_err(|_| SocksError::Timeout)?;

    let handshake = match negotiated {
        Ok(handshake) => handshake,
        Err(SocksError::AuthenticationFailed) => {
            warn!(peer = %peer, "SOCKS5 connection rejected: unknown resource key");
            return Err(SocksError::AuthenticationFailed);
        }
        Err(e) => return Err(e),
    };

    let meta = match &handshake.meta {
        Some(meta) => meta.to_string(),
        None => "-".to_string(),
    };

    if let Err(e) = access.check(handshake.key, &handshake.destination) {
        warn!(
            peer = %peer,
            meta = %meta,
            destination = %handshake.destination,
            "SOCKS5 connection rejected: {}",
            e
        );
        write_reply(&mut stream, Reply::ConnectionNotAllowed, None).await?;
        return Err(e.into());
    }

    info!(
        peer = %peer,
        meta = %meta,
        destination = %handshake.destination,
        "SOCKS5 connection accepted"
    );

    let destination = handshake.destination;
    let connect = TcpStream::connect((destination.host.as_str(), destination.port));
    let mut upstream =
        match tokio::time::timeout(Duration::from_secs(config.connect_timeout_secs), connect).await
        {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(e)) => {
                let reply = match e.kind() {
                    std::io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
                    _ => Reply::HostUnreachable,
                };
                write_reply(&mut stream, reply, None).await?;
                return Err(SocksError::ConnectFailed {
                    destination,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                write_reply(&mut stream, Reply::HostUnreachable, None).await?;
                return Err(SocksError::ConnectFailed {
                    destination,
                    reason: "timed out".to_string(),
                });
            }
        };

    let bound = upstream.local_addr().ok();
    write_reply(&mut stream, Reply::Succeeded, bound).await?;

    let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
    debug!(
        peer = %peer,
        destination = %destination,
        bytes_up = up,
        bytes_down = down,
        "SOCKS5 connection finished"
    );
    Ok(())
}

/// Greeting, authentication and request. Replies to failures itself.
async fn negotiate(stream: &mut TcpStream, access: &AccessTable) -> Result<Handshake, SocksError> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(SocksError::InvalidVersion(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_USERNAME_PASSWORD) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        return Err(SocksError::NoAcceptableMethod);
    }
    stream
        .write_all(&[SOCKS_VERSION, METHOD_USERNAME_PASSWORD])
        .await?;

    // RFC 1929 sub-negotiation
    let version = stream.read_u8().await?;
    if version != AUTH_VERSION {
        return Err(SocksError::InvalidVersion(version));
    }
    let username = read_string(stream).await?;
    let password = read_string(stream).await?;

    let meta = ConnectionMeta::parse(&username);
    if meta.is_none() {
        debug!("Ignoring malformed connection metadata: {:?}", username);
    }

    let key = match password.trim().parse::<u64>() {
        Ok(key) if access.contains_key(key) => key,
        _ => {
            stream.write_all(&[AUTH_VERSION, 0x01]).await?;
            return Err(SocksError::AuthenticationFailed);
        }
    };
    stream.write_all(&[AUTH_VERSION, 0x00]).await?;

    // Request
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(SocksError::InvalidVersion(request[0]));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        ATYP_DOMAIN => read_string(stream).await?,
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        other => {
            write_reply(stream, Reply::AddressTypeNotSupported, None).await?;
            return Err(SocksError::UnsupportedAddressType(other));
        }
    };
    let port = stream.read_u16().await?;

    if request[1] != CMD_CONNECT {
        write_reply(stream, Reply::CommandNotSupported, None).await?;
        return Err(SocksError::UnsupportedCommand(request[1]));
    }

    Ok(Handshake {
        key,
        meta,
        destination: Destination::new(host, port),
    })
}

async fn read_string(stream: &mut TcpStream) -> Result<String, SocksError> {
    let len = stream.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn write_reply(
    stream: &mut TcpStream,
    reply: Reply,
    bound: Option<SocketAddr>,
) -> Result<(), SocksError> {
    let mut buf = vec![SOCKS_VERSION, reply as u8, 0x00];
    match bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0))) {
        SocketAddr::V4(addr) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
            buf.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    stream.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_parses_pairs() {
        let meta = ConnectionMeta::parse("client=10.1.2.3;user=alice").unwrap();
        assert_eq!(meta.get("client"), Some("10.1.2.3"));
        assert_eq!(meta.get("user"), Some("alice"));
        assert_eq!(meta.to_string(), "client=10.1.2.3 user=alice");
    }

    #[test]
    fn test_metadata_empty_username() {
        assert_eq!(ConnectionMeta::parse(""), Some(ConnectionMeta::default()));
    }

    #[test]
    fn test_metadata_malformed() {
        assert_eq!(ConnectionMeta::parse("no-equals-sign"), None);
        assert_eq!(ConnectionMeta::parse("=value"), None);
    }
}
