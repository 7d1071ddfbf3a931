//! End-to-end handshake tests over the duplex binding.
//!
//! Both peers run their real drivers over in-memory WebSocket streams, so
//! frames cross an actual codec and socket boundary.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lhs::connection::drive;
use lhs::protocol::{
    AllowAll, AuthDescriptor, Bind, BindContext, Encoding, EstablishedSession, Feature,
    FeatureSet, Frame, FrameCodec, Handshake, HandshakeTimeouts, Hello, IdentityProvider,
    ReplayGuard, ServerContext, ServerSupport, StaticTokens, Step, ThreadId, TrustSealer,
};
use lhs::transport::ControlTransport;
use lhs::{DuplexTransport, ErrorCode, HandshakeClient, LhsError, Result, RetryPolicy};
use tokio::io::DuplexStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type Transport = DuplexTransport<DuplexStream>;

/// Connected (server, client) transports over one in-memory socket
async fn ws_pair() -> (Transport, Transport) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
    (DuplexTransport::new(server), DuplexTransport::new(client))
}

fn context(support: ServerSupport, identity: Arc<dyn IdentityProvider>) -> Arc<ServerContext> {
    Arc::new(ServerContext::new(
        support,
        TrustSealer::generate(),
        identity,
        ReplayGuard::default(),
    ))
}

fn client_for(ctx: &ServerContext, hello: Hello, token: &str) -> HandshakeClient {
    let bind = Bind::new(&ThreadId::generate(), AuthDescriptor::bearer(token));
    HandshakeClient::new(hello, bind, ctx.sealer().verifier()).with_retry(RetryPolicy::none())
}

async fn serve(
    ctx: Arc<ServerContext>,
    timeouts: HandshakeTimeouts,
    mut transport: Transport,
) -> (Handshake, Result<EstablishedSession>, Transport) {
    let mut machine = Handshake::server(ctx, timeouts);
    let mut codec = FrameCodec::new(machine.frame_limit());
    let result = drive(&mut machine, &mut transport, &mut codec).await;
    (machine, result, transport)
}

fn encode(frame: &Frame) -> Vec<u8> {
    serde_json::to_vec(frame).unwrap()
}

fn decode(bytes: &[u8]) -> Frame {
    serde_json::from_slice(bytes).unwrap()
}

/// Test complete handshake followed by Flow traffic
#[tokio::test]
async fn test_full_duplex_handshake_then_flow() {
    let ctx = context(ServerSupport::default(), Arc::new(AllowAll));
    let client = client_for(&ctx, Hello::default().with_client_id("agent-7"), "t");
    let (server_side, mut client_side) = ws_pair().await;

    let server = tokio::spawn(serve(Arc::clone(&ctx), HandshakeTimeouts::default(), server_side));
    let client_session = client.handshake_duplex(&mut client_side).await.unwrap();
    let (machine, server_result, server_side) = server.await.unwrap();
    let server_session = server_result.unwrap();

    assert_eq!(server_session.session_id(), client_session.session_id());
    assert_eq!(server_session.nonce(), client_session.nonce());
    assert_eq!(server_session.client_id(), Some("agent-7"));
    assert_eq!(machine.steps(), &[Step::Hello, Step::Mirror, Step::Bind, Step::Seal]);
    assert!(ctx.replay().contains(server_session.nonce()));

    // After Seal the socket belongs to the payload channel
    let mut server_ws = server_side.into_inner();
    let mut client_ws = client_side.into_inner();
    client_ws
        .send(Message::Text("{\"flow\":1}".into()))
        .await
        .unwrap();
    let received = server_ws.next().await.unwrap().unwrap();
    assert_eq!(received.into_text().unwrap(), "{\"flow\":1}");
}

/// Float-valued affect in Bind verifies after crossing the socket
#[tokio::test]
async fn test_float_affect_handshake() {
    let ctx = context(ServerSupport::default(), Arc::new(AllowAll));
    let bind = Bind::new(&ThreadId::generate(), AuthDescriptor::bearer("t")).with_context(
        BindContext {
            intent: Some("ask".to_string()),
            affect: Some(serde_json::json!({
                "valence": 0.9719863718547629,
                "pad": [0.5, 0.3, 0.1],
                "arousal": 1.0 / 3.0,
            })),
        },
    );
    let client = HandshakeClient::new(Hello::default(), bind, ctx.sealer().verifier())
        .with_retry(RetryPolicy::none());
    let (server_side, mut client_side) = ws_pair().await;

    let server = tokio::spawn(serve(Arc::clone(&ctx), HandshakeTimeouts::default(), server_side));
    let client_session = client.handshake_duplex(&mut client_side).await.unwrap();
    let server_session = server.await.unwrap().1.unwrap();
    assert_eq!(server_session.session_id(), client_session.session_id());
}

/// json/cbor + ltp/lss offered to a json + ltp server
#[tokio::test]
async fn test_scenario_a_negotiation() {
    let support = ServerSupport::default()
        .with_encodings(vec![Encoding::Json])
        .with_features(FeatureSet::from(vec![Feature::Ltp]));
    let cap = support.max_frame_cap;
    let ctx = context(support, Arc::new(AllowAll));
    let client = client_for(&ctx, Hello::default(), "t");
    let (server_side, mut client_side) = ws_pair().await;

    let server = tokio::spawn(serve(Arc::clone(&ctx), HandshakeTimeouts::default(), server_side));
    let session = client.handshake_duplex(&mut client_side).await.unwrap();
    server.await.unwrap().1.unwrap();

    assert_eq!(session.encoding(), Encoding::Json);
    assert_eq!(session.features(), &FeatureSet::from(vec![Feature::Ltp]));
    assert!(!session.has_feature(Feature::Lss));
    assert_eq!(session.max_frame_bytes(), 65536.min(cap));
}

/// Unsupported major version is refused before any Mirror
#[tokio::test]
async fn test_scenario_b_version_mismatch() {
    let ctx = context(ServerSupport::default(), Arc::new(AllowAll));
    let client = client_for(&ctx, Hello::default().with_version("9.0"), "t");
    let (server_side, mut client_side) = ws_pair().await;

    let server = tokio::spawn(serve(Arc::clone(&ctx), HandshakeTimeouts::default(), server_side));
    let err = client.handshake_duplex(&mut client_side).await.unwrap_err();
    let (machine, server_result, _) = server.await.unwrap();

    assert!(matches!(
        err,
        LhsError::PeerRejected {
            code: ErrorCode::VersionMismatch,
            ..
        }
    ));
    assert_eq!(server_result.unwrap_err().code(), ErrorCode::VersionMismatch);
    assert_eq!(machine.steps(), &[Step::Hello]);
    assert_eq!(ctx.replay().live_count(), 0);
}

/// A Seal signed over a Bind altered in transit never reaches Flow
#[tokio::test]
async fn test_scenario_c_tampered_bind() {
    let ctx = context(ServerSupport::default(), Arc::new(AllowAll));
    let client = client_for(&ctx, Hello::default(), "original-token");
    let (server_side, mut relay_to_server) = ws_pair().await;
    let (mut relay_to_client, mut client_side) = ws_pair().await;

    let server = tokio::spawn(serve(Arc::clone(&ctx), HandshakeTimeouts::default(), server_side));
    let relay = tokio::spawn(async move {
        let hello = relay_to_client.recv().await.unwrap().unwrap();
        relay_to_server.send(hello).await.unwrap();
        let mirror = relay_to_server.recv().await.unwrap().unwrap();
        relay_to_client.send(mirror).await.unwrap();

        let bind = relay_to_client.recv().await.unwrap().unwrap();
        let Frame::Bind(mut bind) = decode(&bind) else {
            panic!("expected bind");
        };
        bind.auth = Some(AuthDescriptor::bearer("swapped-token"));
        relay_to_server.send(encode(&Frame::Bind(bind))).await.unwrap();

        let seal = relay_to_server.recv().await.unwrap().unwrap();
        relay_to_client.send(seal).await.unwrap();
        // The client's verdict
        relay_to_client.recv().await.unwrap()
    });

    let err = client.handshake_duplex(&mut client_side).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::TrustFailed);

    let verdict = relay.await.unwrap().unwrap();
    match decode(&verdict) {
        Frame::Error(e) => assert_eq!(e.code, ErrorCode::TrustFailed),
        other => panic!("expected error frame, got {other:?}"),
    }
    // The server cannot tell; it sealed what it received
    server.await.unwrap().1.unwrap();
}

/// Concurrent handshakes never share a nonce
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scenario_d_concurrent_nonces_unique() {
    let ctx = context(ServerSupport::default(), Arc::new(AllowAll));
    let mut tasks = Vec::new();

    for _ in 0..64 {
        let ctx = Arc::clone(&ctx);
        tasks.push(tokio::spawn(async move {
            let client = client_for(&ctx, Hello::default(), "t");
            let (server_side, mut client_side) = ws_pair().await;
            let server = tokio::spawn(serve(Arc::clone(&ctx), HandshakeTimeouts::default(), server_side));
            let session = client.handshake_duplex(&mut client_side).await.unwrap();
            server.await.unwrap().1.unwrap();
            session.nonce().to_string()
        }));
    }

    let mut nonces = HashSet::new();
    for task in tasks {
        assert!(nonces.insert(task.await.unwrap()));
    }
    assert_eq!(nonces.len(), 64);
    assert_eq!(ctx.replay().live_count(), 64);
}

/// Bind missing its deadline ends the handshake without a Seal
#[tokio::test]
async fn test_bind_timeout_no_seal() {
    let ctx = context(ServerSupport::default(), Arc::new(AllowAll));
    let timeouts = HandshakeTimeouts {
        bind: Duration::from_millis(50),
        ..HandshakeTimeouts::default()
    };
    let (server_side, mut client_side) = ws_pair().await;
    let server = tokio::spawn(serve(Arc::clone(&ctx), timeouts, server_side));

    client_side
        .send(encode(&Frame::Hello(Hello::default())))
        .await
        .unwrap();
    let mirror = decode(&client_side.recv().await.unwrap().unwrap());
    assert!(matches!(mirror, Frame::Mirror(_)));

    // Never send Bind
    let next = decode(&client_side.recv().await.unwrap().unwrap());
    match next {
        Frame::Error(e) => assert_eq!(e.code, ErrorCode::Timeout),
        other => panic!("expected timeout error, got {other:?}"),
    }

    let (machine, result, _) = server.await.unwrap();
    assert!(matches!(result.unwrap_err(), LhsError::Timeout(Step::Bind)));
    assert!(!machine.steps().contains(&Step::Seal));
    assert_eq!(ctx.replay().live_count(), 0);
}

/// Client gives up when no Mirror arrives in time
#[tokio::test]
async fn test_mirror_timeout() {
    let ctx = context(ServerSupport::default(), Arc::new(AllowAll));
    let client = client_for(&ctx, Hello::default(), "t")
        .with_timeouts(HandshakeTimeouts::uniform(Duration::from_millis(50)));
    let (mut silent_server, mut client_side) = ws_pair().await;

    let err = client.handshake_duplex(&mut client_side).await.unwrap_err();
    assert!(matches!(err, LhsError::Timeout(Step::Mirror)));

    // Hello, then the client's timeout report
    assert!(matches!(
        decode(&silent_server.recv().await.unwrap().unwrap()),
        Frame::Hello(_)
    ));
    match decode(&silent_server.recv().await.unwrap().unwrap()) {
        Frame::Error(e) => assert_eq!(e.code, ErrorCode::Timeout),
        other => panic!("expected timeout error, got {other:?}"),
    }
}

/// Rejected credentials end the handshake with invalid_bind
#[tokio::test]
async fn test_rejected_credential() {
    let tokens = StaticTokens::new().with_token("bearer", "letmein");
    let ctx = context(ServerSupport::default(), Arc::new(tokens));
    let client = client_for(&ctx, Hello::default(), "wrong");
    let (server_side, mut client_side) = ws_pair().await;

    let server = tokio::spawn(serve(Arc::clone(&ctx), HandshakeTimeouts::default(), server_side));
    let err = client.handshake_duplex(&mut client_side).await.unwrap_err();
    let (_, server_result, _) = server.await.unwrap();

    assert_eq!(err.code(), ErrorCode::InvalidBind);
    assert_eq!(server_result.unwrap_err().code(), ErrorCode::InvalidBind);
    assert_eq!(ctx.replay().live_count(), 0);
}

/// A server without the trust feature cannot complete a handshake
#[tokio::test]
async fn test_trust_feature_required() {
    let support = ServerSupport::default().with_features(FeatureSet::from(vec![Feature::Lss]));
    let ctx = context(support, Arc::new(AllowAll));
    let client = client_for(&ctx, Hello::default(), "t");
    let (server_side, mut client_side) = ws_pair().await;

    let server = tokio::spawn(serve(Arc::clone(&ctx), HandshakeTimeouts::default(), server_side));
    let err = client.handshake_duplex(&mut client_side).await.unwrap_err();
    server.await.unwrap().1.unwrap_err();

    assert_eq!(err.code(), ErrorCode::TrustFailed);
}

/// A frame for the wrong step is answered with out_of_order
#[tokio::test]
async fn test_out_of_order_frame() {
    let ctx = context(ServerSupport::default(), Arc::new(AllowAll));
    let (server_side, mut client_side) = ws_pair().await;
    let server = tokio::spawn(serve(Arc::clone(&ctx), HandshakeTimeouts::default(), server_side));

    let bind = Bind::new(&ThreadId::generate(), AuthDescriptor::bearer("t"));
    client_side.send(encode(&Frame::Bind(bind))).await.unwrap();

    match decode(&client_side.recv().await.unwrap().unwrap()) {
        Frame::Error(e) => assert_eq!(e.code, ErrorCode::OutOfOrder),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert_eq!(
        server.await.unwrap().1.unwrap_err().code(),
        ErrorCode::OutOfOrder
    );
}

/// Oversized frames are refused before parsing
#[tokio::test]
async fn test_frame_too_large() {
    let support = ServerSupport::default().with_max_frame_cap(512);
    let ctx = context(support, Arc::new(AllowAll));
    let (server_side, mut client_side) = ws_pair().await;
    let server = tokio::spawn(serve(Arc::clone(&ctx), HandshakeTimeouts::default(), server_side));

    let padding = "x".repeat(4096);
    let hello = Hello::default().with_client_id(padding);
    client_side.send(encode(&Frame::Hello(hello))).await.unwrap();

    match decode(&client_side.recv().await.unwrap().unwrap()) {
        Frame::Error(e) => assert_eq!(e.code, ErrorCode::FrameTooLarge),
        other => panic!("expected error frame, got {other:?}"),
    }
    assert_eq!(
        server.await.unwrap().1.unwrap_err().code(),
        ErrorCode::FrameTooLarge
    );
}
