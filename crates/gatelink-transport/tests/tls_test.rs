//! Gateway identity checks against a local rustls server

use gatelink_transport::{GatewayConnector, TlsSettings, TransportError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

struct TestCert {
    der: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

fn make_cert(common_name: &str, san: &str) -> TestCert {
    let mut params = rcgen::CertificateParams::new(vec![san.to_string()]).unwrap();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();

    TestCert {
        der: cert.der().clone(),
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
    }
}

/// Accept one TLS connection, echo one byte back, return the port
async fn spawn_server(cert: &TestCert) -> u16 {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der.clone()], cert.key.clone_key())
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        if let Ok(mut tls) = acceptor.accept(tcp).await {
            let mut buf = [0u8; 1];
            if tls.read_exact(&mut buf).await.is_ok() {
                let _ = tls.write_all(&buf).await;
                let _ = tls.flush().await;
            }
        }
    });

    port
}

fn settings_trusting(cert: &TestCert) -> TlsSettings {
    TlsSettings {
        ca_certificates: vec![cert.der.clone()],
        insecure: false,
        connect_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn test_matching_common_name_is_accepted() {
    let cert = make_cert("localhost", "localhost");
    let port = spawn_server(&cert).await;

    let connector = GatewayConnector::new("localhost", port, &settings_trusting(&cert)).unwrap();
    let mut stream = connector.connect().await.unwrap();

    stream.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"x");
}

#[tokio::test]
async fn test_common_name_decides_even_when_san_differs() {
    let cert = make_cert("localhost", "unrelated.example");
    let port = spawn_server(&cert).await;

    let connector = GatewayConnector::new("localhost", port, &settings_trusting(&cert)).unwrap();
    assert!(connector.connect().await.is_ok());
}

#[tokio::test]
async fn test_mismatched_common_name_is_rejected() {
    let cert = make_cert("impostor.example", "localhost");
    let port = spawn_server(&cert).await;

    let connector = GatewayConnector::new("localhost", port, &settings_trusting(&cert)).unwrap();
    match connector.connect().await {
        Err(TransportError::Tls(message)) => assert!(message.contains("common name")),
        other => panic!("Expected TLS failure, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_untrusted_chain_is_rejected() {
    let served = make_cert("localhost", "localhost");
    let other = make_cert("localhost", "localhost");
    let port = spawn_server(&served).await;

    let connector = GatewayConnector::new("localhost", port, &settings_trusting(&other)).unwrap();
    assert!(matches!(
        connector.connect().await,
        Err(TransportError::Tls(_))
    ));
}

#[tokio::test]
async fn test_insecure_mode_skips_verification() {
    let cert = make_cert("impostor.example", "impostor.example");
    let port = spawn_server(&cert).await;

    let settings = TlsSettings {
        insecure: true,
        ..TlsSettings::default()
    };
    let connector = GatewayConnector::new("localhost", port, &settings).unwrap();
    assert!(connector.connect().await.is_ok());
}
