//! SOCKS5 front-end with a real client handshake and an echo upstream

use gatelink_agent::{AccessTable, Socks5Config, Socks5Server};
use gatelink_proto::{RegisteredResource, ResourceRule};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const KEY: u64 = 4_242_424_242;

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

fn resource(key: u64, host: &str, port: u16) -> RegisteredResource {
    RegisteredResource {
        rule: ResourceRule {
            name: "echo".to_string(),
            pattern: "echo.*".to_string(),
            allowed_identities: vec![],
            host: host.to_string(),
            port,
            client_scope: None,
        },
        key,
    }
}

async fn start_socks(access: Arc<AccessTable>) -> (SocketAddr, CancellationToken) {
    let config = Socks5Config {
        listen_addr: "127.0.0.1:0".to_string(),
        ..Socks5Config::default()
    };
    let server = Socks5Server::bind(config, access).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));
    (addr, shutdown)
}

/// Greeting and RFC 1929 authentication; returns the auth status byte
async fn authenticate(stream: &mut TcpStream, username: &str, password: &str) -> u8 {
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x02]);

    let mut auth = vec![0x01, username.len() as u8];
    auth.extend_from_slice(username.as_bytes());
    auth.push(password.len() as u8);
    auth.extend_from_slice(password.as_bytes());
    stream.write_all(&auth).await.unwrap();

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await.unwrap();
    assert_eq!(status[0], 0x01);
    status[1]
}

/// Send a request for an IPv4 destination; returns the reply code
async fn request(stream: &mut TcpStream, command: u8, destination: SocketAddr) -> u8 {
    let SocketAddr::V4(v4) = destination else {
        panic!("test destinations are IPv4");
    };
    let mut req = vec![0x05, command, 0x00, 0x01];
    req.extend_from_slice(&v4.ip().octets());
    req.extend_from_slice(&v4.port().to_be_bytes());
    stream.write_all(&req).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[3], 0x01);
    reply[1]
}

#[tokio::test]
async fn test_registered_destination_is_proxied() {
    let echo = echo_server().await;
    let access = Arc::new(AccessTable::new());
    access.replace_from(&[resource(KEY, "127.0.0.1", echo.port())]);
    let (socks, shutdown) = start_socks(access).await;

    let mut client = TcpStream::connect(socks).await.unwrap();
    assert_eq!(
        authenticate(&mut client, "client=10.9.8.7;user=alice", &KEY.to_string()).await,
        0x00
    );
    assert_eq!(request(&mut client, 0x01, echo).await, 0x00);

    client.write_all(b"through the tunnel").await.unwrap();
    let mut buf = [0u8; 18];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through the tunnel");

    shutdown.cancel();
}

#[tokio::test]
async fn test_unregistered_port_is_not_allowed() {
    let echo = echo_server().await;
    let access = Arc::new(AccessTable::new());
    access.replace_from(&[resource(KEY, "127.0.0.1", echo.port())]);
    let (socks, _shutdown) = start_socks(access).await;

    let mut client = TcpStream::connect(socks).await.unwrap();
    assert_eq!(authenticate(&mut client, "", &KEY.to_string()).await, 0x00);

    let other_port = SocketAddr::new(echo.ip(), echo.port().wrapping_add(1));
    assert_eq!(request(&mut client, 0x01, other_port).await, 0x02);
}

#[tokio::test]
async fn test_unknown_key_fails_authentication() {
    let access = Arc::new(AccessTable::new());
    access.replace_from(&[resource(KEY, "127.0.0.1", 9)]);
    let (socks, _shutdown) = start_socks(access).await;

    let mut client = TcpStream::connect(socks).await.unwrap();
    assert_eq!(authenticate(&mut client, "", "12345").await, 0x01);

    let mut client = TcpStream::connect(socks).await.unwrap();
    assert_eq!(authenticate(&mut client, "", "not-a-key").await, 0x01);
}

#[tokio::test]
async fn test_rotated_key_stops_working() {
    let echo = echo_server().await;
    let access = Arc::new(AccessTable::new());
    access.replace_from(&[resource(KEY, "127.0.0.1", echo.port())]);
    let (socks, _shutdown) = start_socks(access.clone()).await;

    access.replace_from(&[resource(KEY + 1, "127.0.0.1", echo.port())]);

    let mut client = TcpStream::connect(socks).await.unwrap();
    assert_eq!(authenticate(&mut client, "", &KEY.to_string()).await, 0x01);

    let mut client = TcpStream::connect(socks).await.unwrap();
    assert_eq!(
        authenticate(&mut client, "", &(KEY + 1).to_string()).await,
        0x00
    );
    assert_eq!(request(&mut client, 0x01, echo).await, 0x00);
}

#[tokio::test]
async fn test_malformed_metadata_does_not_block_access() {
    let echo = echo_server().await;
    let access = Arc::new(AccessTable::new());
    access.replace_from(&[resource(KEY, "127.0.0.1", echo.port())]);
    let (socks, _shutdown) = start_socks(access).await;

    let mut client = TcpStream::connect(socks).await.unwrap();
    assert_eq!(
        authenticate(&mut client, "garbage-without-pairs", &KEY.to_string()).await,
        0x00
    );
    assert_eq!(request(&mut client, 0x01, echo).await, 0x00);
}

#[tokio::test]
async fn test_bind_command_is_not_supported() {
    let echo = echo_server().await;
    let access = Arc::new(AccessTable::new());
    access.replace_from(&[resource(KEY, "127.0.0.1", echo.port())]);
    let (socks, _shutdown) = start_socks(access).await;

    let mut client = TcpStream::connect(socks).await.unwrap();
    assert_eq!(authenticate(&mut client, "", &KEY.to_string()).await, 0x00);
    assert_eq!(request(&mut client, 0x02, echo).await, 0x07);
}
