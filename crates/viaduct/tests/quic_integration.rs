//! End-to-end tests against a real `quinn` client/server pair over
//! loopback, using throwaway self-signed certificates (`rcgen`). Covers
//! spec scenario S6 (sync write correlation and timeout), a raw-stream
//! round trip, and property 8 (`Close` is idempotent; subsequent
//! `Read`/`Write` fail with `closed`). S7 (stream exhaustion with
//! `autoFree` on and off) is covered by the `stream_manager` unit tests,
//! which can drive the cap deterministically without a real QUIC session.

use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{ClientConfig, Endpoint, ServerConfig};
use viaduct::{QuicConnection, QuicConnectionConfig, StreamManagerConfig};

fn self_signed_server_config() -> (ServerConfig, rustls_pki_types::CertificateDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).expect("self-signed cert");
    let cert_der = cert.cert.der().clone();
    let key_der = rustls_pki_types::PrivateKeyDer::Pkcs8(cert.signing_key.serialize_der().into());

    let mut rustls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .expect("rustls server config");
    rustls_config.alpn_protocols = vec![b"viaduct-test".to_vec()];

    let quic_server_config: QuicServerConfig = rustls_config.try_into().expect("quic server config");
    (ServerConfig::with_crypto(Arc::new(quic_server_config)), cert_der)
}

fn client_config_trusting(cert: rustls_pki_types::CertificateDer<'static>) -> ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert).expect("add root cert");

    let mut rustls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    rustls_config.alpn_protocols = vec![b"viaduct-test".to_vec()];

    let quic_client_config: QuicClientConfig = rustls_config.try_into().expect("quic client config");
    ClientConfig::new(Arc::new(quic_client_config))
}

/// Spins up a loopback server and a connected client, returning both
/// sides' `quinn::Connection`.
async fn connected_pair() -> (quinn::Connection, quinn::Connection) {
    let (server_config, cert) = self_signed_server_config();
    let server = Endpoint::server(server_config, "127.0.0.1:0".parse().unwrap()).expect("server endpoint");
    let server_addr = server.local_addr().expect("server addr");

    let mut client = Endpoint::client("127.0.0.1:0".parse().unwrap()).expect("client endpoint");
    client.set_default_client_config(client_config_trusting(cert));

    let accept = tokio::spawn(async move {
        let incoming = server.accept().await.expect("incoming connection");
        incoming.await.expect("server handshake")
    });

    let client_conn = client
        .connect(server_addr, "localhost")
        .expect("connect")
        .await
        .expect("client handshake");
    let server_conn = accept.await.expect("accept task");

    (client_conn, server_conn)
}

#[tokio::test]
async fn sync_write_correlates_with_the_response() {
    let (client_conn, server_conn) = connected_pair().await;

    let server = QuicConnection::new(server_conn, QuicConnectionConfig::default());
    server.serve();

    let client = QuicConnection::new(
        client_conn,
        QuicConnectionConfig {
            stream_manager: StreamManagerConfig::default(),
            auto_route: true,
        },
    );
    client.serve();

    server
        .mux()
        .handle(
            "ping",
            r"^test$",
            Arc::new(EchoHandler),
        )
        .unwrap();

    let mut request = agent_bus::Message::new("bus", "test", "ping").with_content(serde_json::json!({"n": 1}));
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        client.write_message_sync(&mut request),
    )
    .await
    .expect("did not time out")
    .expect("sync write succeeded");

    assert_eq!(response.content["echo"], serde_json::json!(1));
}

#[tokio::test]
async fn sync_write_times_out_when_nobody_responds() {
    let (client_conn, server_conn) = connected_pair().await;

    // Server accepts streams (so the QUIC handshake completes cleanly) but
    // never answers application messages.
    let server = QuicConnection::new(server_conn, QuicConnectionConfig::default());
    server.serve();

    let client = QuicConnection::new(client_conn, QuicConnectionConfig::default());
    client.serve();
    client.set_write_deadline(Some(std::time::Instant::now() + Duration::from_millis(200)));

    let mut request = agent_bus::Message::new("bus", "test", "silence");
    let err = client.write_message_sync(&mut request).await.unwrap_err();
    assert!(matches!(err, viaduct::Error::Timeout { .. }));
}

#[tokio::test]
async fn raw_write_then_read_round_trips_over_a_pooled_stream() {
    let (client_conn, server_conn) = connected_pair().await;

    let server = QuicConnection::new(server_conn, QuicConnectionConfig::default());
    server.serve();
    let client = QuicConnection::new(client_conn, QuicConnectionConfig::default());
    client.serve();

    client.write(b"raw payload").await.expect("raw write opens a stream-type duplex");

    let mut buf = [0u8; 32];
    let n = tokio::time::timeout(Duration::from_secs(5), read_until_some(&server, &mut buf))
        .await
        .expect("server read did not time out");
    assert_eq!(&buf[..n], b"raw payload");
}

#[tokio::test]
async fn close_is_idempotent_and_fails_subsequent_reads_and_writes_with_closed() {
    let (client_conn, server_conn) = connected_pair().await;

    let server = QuicConnection::new(server_conn, QuicConnectionConfig::default());
    server.serve();
    let client = QuicConnection::new(client_conn, QuicConnectionConfig::default());
    client.serve();

    client.close().await;
    client.close().await; // idempotent: must not panic or double-free
    assert!(client.is_closed());

    let mut buf = [0u8; 8];
    assert!(matches!(client.read(&mut buf).await, Err(viaduct::Error::Closed { .. })));
    assert!(matches!(client.write(b"x").await, Err(viaduct::Error::Closed { .. })));
    assert!(matches!(client.write_message_async(&agent_bus::Message::new("bus", "test", "op")).await, Err(viaduct::Error::Closed { .. })));
    let mut request = agent_bus::Message::new("bus", "test", "op");
    assert!(matches!(client.write_message_sync(&mut request).await, Err(viaduct::Error::Closed { .. })));
}

/// `server.read` only succeeds once the accept loop has registered the
/// peer-opened stream; retry briefly rather than racing it.
async fn read_until_some(conn: &QuicConnection, buf: &mut [u8]) -> usize {
    loop {
        match conn.read(buf).await {
            Ok(n) => return n,
            Err(viaduct::Error::Exhausted { .. }) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(err) => panic!("unexpected read error: {err}"),
        }
    }
}

struct EchoHandler;

#[async_trait::async_trait]
impl viaduct::Handler for EchoHandler {
    async fn handle(&self, request: viaduct::MessageRequest) {
        let n = request.message.content["n"].clone();
        let response = request
            .message
            .new_response(serde_json::json!({"echo": n}));
        let _ = request.responder.respond(&response).await;
    }
}
