//! End-to-end transport tests over loopback.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use mconn_transport::network::node_info::{NodeInfoOther, ProtocolVersion};
use mconn_transport::{
    ChannelDescriptor, ConnFilter, Connection, ConnectionSet, DuplicateIpFilter, Endpoint,
    MConnConfig, NodeInfo, NodeKey, RawConnId, RejectReason, RejectedError, StreamError,
    Transport, TransportError, TransportOptions,
};

const CHANNEL: u8 = 0x01;

fn node(seed: u8, options: TransportOptions) -> Arc<Transport> {
    let node_key = NodeKey::from_bytes(&[seed; 32]);
    let node_info = NodeInfo {
        protocol_version: ProtocolVersion::current(),
        node_id: node_key.id(),
        listen_addr: "127.0.0.1:26656".to_string(),
        network: "e2e-net".to_string(),
        version: "0.3.0".to_string(),
        channels: vec![CHANNEL],
        moniker: format!("node-{}", seed),
        other: NodeInfoOther::default(),
    };
    let transport = Transport::new(node_key, node_info, MConnConfig::default(), options);
    transport.set_channel_descriptors(vec![ChannelDescriptor::new(CHANNEL)
        .with_send_queue_capacity(16)
        .with_recv_message_capacity(1024 * 1024)]);
    Arc::new(transport)
}

async fn listening(seed: u8, options: TransportOptions) -> (Arc<Transport>, Endpoint) {
    let transport = node(seed, options);
    let local: Endpoint = "mconn://127.0.0.1:0".parse().unwrap();
    transport.listen(&local).await.unwrap();
    let endpoint = transport.endpoints().pop().unwrap();
    (transport, endpoint)
}

async fn accept_one(transport: &Transport) -> Result<Connection, TransportError> {
    let ctx = CancellationToken::new();
    tokio::time::timeout(Duration::from_secs(5), transport.accept(&ctx))
        .await
        .expect("accept timed out")
        .map(|conn| conn.expect("accept cancelled"))
}

#[tokio::test]
async fn test_message_and_eof_marker_reach_peer() {
    let (server, endpoint) = listening(1, TransportOptions::default()).await;
    let client = node(2, TransportOptions::default());

    let ctx = CancellationToken::new();
    let (dialed, accepted) = tokio::join!(client.dial(&ctx, &endpoint), accept_one(&server));
    let dialed = dialed.unwrap();
    let accepted = accepted.unwrap();

    assert_eq!(dialed.node_info().moniker, "node-1");
    assert_eq!(accepted.node_info().moniker, "node-2");
    assert_eq!(dialed.public_key(), NodeKey::from_bytes(&[1; 32]).public_key());
    assert_eq!(accepted.public_key(), NodeKey::from_bytes(&[2; 32]).public_key());

    let out = dialed.stream(u16::from(CHANNEL)).unwrap();
    assert_eq!(out.write(&b"hello"[..]).await.unwrap(), 5);

    let input = accepted.stream(u16::from(CHANNEL)).unwrap();
    let mut buf = [0u8; 64];
    let n = input.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(input.read(&mut buf).await.unwrap(), 0);

    dialed.close();
    accepted.close();
}

#[tokio::test]
async fn test_unknown_stream_is_reported() {
    let (server, endpoint) = listening(3, TransportOptions::default()).await;
    let client = node(4, TransportOptions::default());

    let ctx = CancellationToken::new();
    let (dialed, accepted) = tokio::join!(client.dial(&ctx, &endpoint), accept_one(&server));
    let dialed = dialed.unwrap();
    accepted.unwrap();

    assert!(matches!(
        dialed.stream(0x7f),
        Err(TransportError::UnknownChannel(0x7f))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_dials_from_one_ip_admit_one() {
    let filters: Vec<Arc<dyn ConnFilter>> = vec![Arc::new(DuplicateIpFilter)];
    let (server, endpoint) =
        listening(5, TransportOptions::default().with_conn_filters(filters)).await;
    let client = node(6, TransportOptions::default());
    let ctx = CancellationToken::new();

    let (dial_a, dial_b, accept_a, accept_b) = tokio::join!(
        client.dial(&ctx, &endpoint),
        client.dial(&ctx, &endpoint),
        accept_one(&server),
        accept_one(&server),
    );

    assert_eq!([&dial_a, &dial_b].iter().filter(|r| r.is_ok()).count(), 1);
    let accepted = [accept_a, accept_b];
    assert_eq!(accepted.iter().filter(|r| r.is_ok()).count(), 1);
    let err = accepted.iter().find_map(|r| r.as_ref().err()).unwrap();
    let rejection = err.as_rejected().expect("expected a rejection");
    assert!(rejection.is_duplicate(), "unexpected rejection: {}", rejection);
    assert_eq!(server.conn_set().len(), 1);
}

#[tokio::test]
async fn test_self_dial_is_rejected() {
    let (server, endpoint) = listening(7, TransportOptions::default()).await;
    let ctx = CancellationToken::new();

    let err = server.dial(&ctx, &endpoint).await.unwrap_err();
    let rejection = err.as_rejected().expect("expected a rejection");
    assert!(rejection.is_self(), "unexpected rejection: {}", rejection);
    assert_eq!(rejection.reason(), RejectReason::SelfConnect);
}

#[tokio::test]
async fn test_wrong_peer_id_fails_authentication() {
    let (_server, endpoint) = listening(8, TransportOptions::default()).await;
    let client = node(9, TransportOptions::default());
    let ctx = CancellationToken::new();

    let impostor = NodeKey::from_bytes(&[10; 32]).id();
    let wrong = endpoint.clone().with_peer_id(impostor.clone());
    let err = client.dial(&ctx, &wrong).await.unwrap_err();
    let rejection = err.as_rejected().expect("expected a rejection");
    assert!(rejection.is_auth_failure());
    assert!(client.conn_set().is_empty());
}

struct SlowFilter(Duration);

#[async_trait]
impl ConnFilter for SlowFilter {
    async fn evaluate(
        &self,
        _conns: &ConnectionSet,
        _conn: &RawConnId,
        _ips: &[IpAddr],
    ) -> Result<(), RejectedError> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_slow_filter_times_out() {
    let (_server, endpoint) = listening(11, TransportOptions::default()).await;
    let filters: Vec<Arc<dyn ConnFilter>> = vec![Arc::new(SlowFilter(Duration::from_secs(5)))];
    let client = node(
        12,
        TransportOptions::default()
            .with_conn_filters(filters)
            .with_filter_timeout(Duration::from_millis(50)),
    );
    let ctx = CancellationToken::new();

    let err = client.dial(&ctx, &endpoint).await.unwrap_err();
    assert!(matches!(err, TransportError::FilterTimeout), "got {}", err);
    assert!(client.conn_set().is_empty());
}

#[tokio::test]
async fn test_closure_filter_rejects() {
    let deny: Vec<Arc<dyn ConnFilter>> = vec![Arc::new(
        |_: &ConnectionSet, conn: &RawConnId, _: &[IpAddr]| {
            Err(RejectedError::filtered(conn.remote, "denied"))
        },
    )];
    let (server, endpoint) = listening(13, TransportOptions::default().with_conn_filters(deny)).await;
    let client = node(14, TransportOptions::default());
    let ctx = CancellationToken::new();

    let (dialed, accepted) = tokio::join!(client.dial(&ctx, &endpoint), accept_one(&server));
    assert!(dialed.is_err());
    let err = accepted.unwrap_err();
    assert!(err.as_rejected().map_or(false, |r| r.is_filtered()));
}

#[tokio::test]
async fn test_close_drops_undelivered_connections() {
    let (server, endpoint) = listening(15, TransportOptions::default()).await;
    let client = node(16, TransportOptions::default());
    let ctx = CancellationToken::new();

    // Nobody accepts on the server, so its side stays queued.
    let dialed = client.dial(&ctx, &endpoint).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.close();

    let stream = dialed.stream(u16::from(CHANNEL)).unwrap();
    let mut buf = [0u8; 16];
    let res = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("peer close not observed");
    assert!(matches!(res, Err(StreamError::Closed(CHANNEL))));
    assert!(dialed.is_closed());

    assert!(matches!(
        server.accept(&ctx).await,
        Err(TransportError::TransportClosed)
    ));
}

#[tokio::test]
async fn test_close_during_handshake_releases_raw_conn() {
    let (server, endpoint) = listening(
        17,
        TransportOptions::default().with_handshake_timeout(Duration::from_millis(200)),
    )
    .await;

    // A peer that connects but never speaks.
    let _silent = tokio::net::TcpStream::connect(endpoint.socket_addr().unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.conn_set().len(), 1);

    server.close();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(server.conn_set().is_empty());
}

#[tokio::test]
async fn test_handshake_finishing_after_close_is_not_delivered() {
    // Holds the inbound socket in filtering until after close.
    let filters: Vec<Arc<dyn ConnFilter>> = vec![Arc::new(SlowFilter(Duration::from_millis(300)))];
    let (server, endpoint) =
        listening(23, TransportOptions::default().with_conn_filters(filters)).await;
    let client = node(24, TransportOptions::default());

    let dial = tokio::spawn({
        let client = client.clone();
        let endpoint = endpoint.clone();
        async move { client.dial(&CancellationToken::new(), &endpoint).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.close();

    let dialed = dial.await.unwrap().expect("server side completes its handshake");
    let stream = dialed.stream(u16::from(CHANNEL)).unwrap();
    let mut buf = [0u8; 16];
    let res = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server never closed the late connection");
    assert!(matches!(res, Err(StreamError::Closed(CHANNEL))));

    assert!(matches!(
        server.accept(&CancellationToken::new()).await,
        Err(TransportError::TransportClosed)
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.conn_set().is_empty());
}

#[tokio::test]
async fn test_accept_cancellation_keeps_transport_usable() {
    let (server, endpoint) = listening(18, TransportOptions::default()).await;

    let ctx = CancellationToken::new();
    ctx.cancel();
    assert!(server.accept(&ctx).await.unwrap().is_none());

    let client = node(19, TransportOptions::default());
    let dial_ctx = CancellationToken::new();
    let (dialed, accepted) = tokio::join!(client.dial(&dial_ctx, &endpoint), accept_one(&server));
    assert!(dialed.is_ok());
    assert!(accepted.is_ok());
}

#[tokio::test]
async fn test_connection_limit_holds_extra_peers() {
    let (server, endpoint) = listening(
        20,
        TransportOptions::default().with_max_incoming_connections(1),
    )
    .await;
    let ctx = CancellationToken::new();

    let first = node(21, TransportOptions::default());
    let (dialed, accepted) = tokio::join!(first.dial(&ctx, &endpoint), accept_one(&server));
    dialed.unwrap();
    let accepted = accepted.unwrap();

    // The second peer's socket is not accepted until a slot frees up.
    let second = node(22, TransportOptions::default());
    let pending = tokio::spawn({
        let endpoint = endpoint.clone();
        async move {
            let ctx = CancellationToken::new();
            second.dial(&ctx, &endpoint).await.map(|_| ())
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pending.is_finished());

    accepted.close();
    let (accepted, dialed) = tokio::join!(accept_one(&server), pending);
    assert!(accepted.is_ok());
    assert!(dialed.unwrap().is_ok());
}
