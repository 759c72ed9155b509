//! End-to-end tests over real UDP sockets with the null-encryption
//! development provider.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use talus_transport::insecure::{InsecureClient, InsecureServerProtocol, PskTable};
use talus_transport::{DtlsTransport, RequestContext, RequestHandler, TransportOptions};

const RESPONSE_WAIT: Duration = Duration::from_secs(5);

/// Greets `/hello` with the authenticated identity, echoes anything else.
struct GreetingHandler;

#[async_trait]
impl RequestHandler for GreetingHandler {
    async fn process_request(&self, context: RequestContext, payload: Bytes) {
        let request = String::from_utf8_lossy(&payload);
        let response = if request == "/hello" {
            let who = context
                .connection_info()
                .and_then(|info| info.get("psk_identity").cloned())
                .unwrap_or_default();
            format!("Hello {who}!")
        } else {
            request.into_owned()
        };
        context
            .reply(response.as_bytes())
            .await
            .expect("reply failed");
    }
}

async fn bind_transport(configure: impl FnOnce(&mut TransportOptions)) -> (DtlsTransport, SocketAddr) {
    let mut options = TransportOptions {
        port: 0,
        ..TransportOptions::default()
    };
    configure(&mut options);

    let mut psk = PskTable::new();
    psk.insert("user", b"password".to_vec());
    let protocol = Arc::new(
        InsecureServerProtocol::new(psk)
            .with_cid_length(4)
            .with_handshake_timeout(Duration::from_secs(5)),
    );

    let transport = DtlsTransport::bind(options, protocol, Arc::new(GreetingHandler))
        .await
        .expect("bind failed");
    let target = SocketAddr::new(
        IpAddr::V6(Ipv6Addr::LOCALHOST),
        transport.local_endpoint().port(),
    );
    (transport, target)
}

#[tokio::test]
async fn psk_roundtrip_with_connection_id() {
    let (transport, target) = bind_transport(|_| {}).await;

    let mut client = InsecureClient::connect(target, "user", b"password", true)
        .await
        .expect("connect failed");
    assert_eq!(client.connection_id().map(|cid| cid.len()), Some(4));

    client.send(b"/hello").await.unwrap();
    let response = client.recv(RESPONSE_WAIT).await.unwrap();
    assert_eq!(&response[..], b"Hello user!");

    let stats = transport.stats();
    assert_eq!(stats.counters.handshakes.success, 1);
    assert_eq!(stats.sessions.len(), 1);
    assert!(stats.sessions[0].has_connection_id);
    assert_eq!(
        stats.sessions[0]
            .connection_info
            .as_ref()
            .and_then(|info| info.get("psk_identity"))
            .map(String::as_str),
        Some("user")
    );

    // Unbind notifies the peer before tearing the association down.
    transport.unbind().await;
    client.send(b"ping").await.unwrap();
    assert!(client.recv(Duration::from_secs(1)).await.is_err());
}

#[tokio::test]
async fn roundtrip_without_connection_id() {
    let (transport, target) = bind_transport(|_| {}).await;

    let mut client = InsecureClient::connect(target, "user", b"password", false)
        .await
        .expect("connect failed");
    assert!(client.connection_id().is_none());

    client.send(b"echo me").await.unwrap();
    let response = client.recv(RESPONSE_WAIT).await.unwrap();
    assert_eq!(&response[..], b"echo me");

    let stats = transport.stats();
    assert!(!stats.sessions[0].has_connection_id);
    transport.unbind().await;
}

#[tokio::test]
async fn session_with_cid_survives_endpoint_migration() {
    let (transport, target) = bind_transport(|_| {}).await;

    let mut client = InsecureClient::connect(target, "user", b"password", true)
        .await
        .expect("connect failed");
    client.send(b"/hello").await.unwrap();
    client.recv(RESPONSE_WAIT).await.unwrap();

    // Same association, new source address.
    client.rebind().await.unwrap();
    client.send(b"/hello").await.unwrap();
    let response = client.recv(RESPONSE_WAIT).await.unwrap();
    assert_eq!(&response[..], b"Hello user!");

    // Still one session, now pointing at the migrated endpoint.
    let stats = transport.stats();
    assert_eq!(stats.counters.handshakes.success, 1);
    assert_eq!(stats.sessions.len(), 1);
    let migrated_port = client.local_addr().unwrap().port();
    assert!(
        stats.sessions[0].endpoint.ends_with(&format!(":{migrated_port}")),
        "session endpoint {} should follow the client to port {}",
        stats.sessions[0].endpoint,
        migrated_port
    );
    transport.unbind().await;
}

#[tokio::test]
async fn idle_session_is_reaped_and_endpoint_can_rehandshake() {
    let (transport, target) = bind_transport(|options| {
        options.session_timeout = Duration::from_secs(1);
        options.session_timeout_with_cid = Duration::from_secs(1);
        options.reaper_interval = Duration::from_millis(200);
    })
    .await;

    let mut client = InsecureClient::connect(target, "user", b"password", true)
        .await
        .expect("connect failed");
    client.send(b"/hello").await.unwrap();
    client.recv(RESPONSE_WAIT).await.unwrap();
    assert_eq!(transport.session_count(), 1);

    // No traffic for longer than the CID timeout: the reaper evicts the
    // session without alerting the (possibly reassigned) endpoint.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(transport.session_count(), 0);

    // Fresh traffic from the same endpoint starts a fresh handshake.
    let mut client = InsecureClient::connect(target, "user", b"password", true)
        .await
        .expect("re-handshake failed");
    client.send(b"/hello").await.unwrap();
    let response = client.recv(RESPONSE_WAIT).await.unwrap();
    assert_eq!(&response[..], b"Hello user!");
    assert_eq!(transport.stats().counters.handshakes.success, 2);
    transport.unbind().await;
}

#[tokio::test]
async fn unknown_identity_is_rejected() {
    let (transport, target) = bind_transport(|_| {}).await;

    let result = InsecureClient::connect(target, "mallory", b"password", false).await;
    assert!(result.is_err());

    // Give the handler task a moment to run its exit path.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = transport.stats();
    assert_eq!(stats.counters.handshakes.tls_error, 1);
    assert_eq!(stats.sessions.len(), 0);
    transport.unbind().await;
}

#[tokio::test]
async fn peer_close_removes_session() {
    let (transport, target) = bind_transport(|_| {}).await;

    let mut client = InsecureClient::connect(target, "user", b"password", true)
        .await
        .expect("connect failed");
    client.send(b"/hello").await.unwrap();
    client.recv(RESPONSE_WAIT).await.unwrap();
    assert_eq!(transport.session_count(), 1);

    client.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.session_count(), 0);
    transport.unbind().await;
}

#[tokio::test]
async fn datagram_with_unknown_cid_is_dropped() {
    let (transport, target) = bind_transport(|_| {}).await;

    // Pin the CID length with one real session.
    let mut client = InsecureClient::connect(target, "user", b"password", true)
        .await
        .expect("connect failed");
    client.send(b"/hello").await.unwrap();
    client.recv(RESPONSE_WAIT).await.unwrap();

    // A well-formed CID record whose CID nobody owns: content type 25,
    // version, epoch, 48-bit sequence, then the four CID bytes.
    let mut rogue = vec![25u8, 254, 253, 0, 1];
    rogue.extend_from_slice(&[0, 0, 0, 0, 0, 9]);
    rogue.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    rogue.extend_from_slice(&[0, 1, 23]);
    let socket = tokio::net::UdpSocket::bind("[::]:0").await.unwrap();
    socket.send_to(&rogue, target).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = transport.stats();
    assert_eq!(stats.counters.packets_received.unknown_cid, 1);
    // The rogue datagram never disturbed the real session.
    client.send(b"/hello").await.unwrap();
    assert_eq!(&client.recv(RESPONSE_WAIT).await.unwrap()[..], b"Hello user!");
    transport.unbind().await;
}
