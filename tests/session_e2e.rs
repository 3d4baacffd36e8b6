//! End-to-end tunnel session tests.
//!
//! Each test runs a real `Session` against a stub broker (an axum
//! server handing the upgraded WebSocket to the test body) and a real
//! local origin (another axum server), so the full path is exercised:
//! registration, WebSocket connect, frame routing, forwarding, and
//! the response encoding rules.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

use localrun::chunks;
use localrun::protocol::{Frame, FrameKind, RequestPayload, ResponsePayload};
use localrun::{Session, SessionEvent, TunnelConfig};

// ---------------------------------------------------------------------------
// Stub broker
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct BrokerState {
    conns: mpsc::Sender<WebSocket>,
    register_status: u16,
}

async fn register_new(State(state): State<BrokerState>) -> Response {
    register_response(&state)
}

async fn register_subdomain(
    State(state): State<BrokerState>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    assert!(
        body.get("subdomain").and_then(|s| s.as_str()).is_some(),
        "subdomain registration must carry a subdomain"
    );
    register_response(&state)
}

fn register_response(state: &BrokerState) -> Response {
    if state.register_status != 200 {
        return (
            axum::http::StatusCode::from_u16(state.register_status).unwrap(),
            Json(serde_json::json!({ "message": "no capacity left" })),
        )
            .into_response();
    }
    Json(serde_json::json!({
        "id": "t1",
        "url": "https://t1.tunnel.test",
        "port": 443,
    }))
    .into_response()
}

async fn ws_upgrade(State(state): State<BrokerState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let _ = state.conns.send(socket).await;
        // The socket now lives with the test body; keep the upgrade
        // task alive so nothing tears the connection down under it.
        std::future::pending::<()>().await
    })
}

/// Starts a stub broker. Returns its base URL and the channel that
/// yields each tunnel WebSocket the client opens.
async fn start_broker(register_status: u16) -> (String, mpsc::Receiver<WebSocket>) {
    let (tx, rx) = mpsc::channel(4);
    let state = BrokerState {
        conns: tx,
        register_status,
    };
    let app = Router::new()
        .route("/", get(register_new))
        .route("/api/tunnels", post(register_subdomain))
        .route("/api/tunnels/{id}/ws", any(ws_upgrade))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), rx)
}

async fn accept_tunnel(conns: &mut mpsc::Receiver<WebSocket>) -> WebSocket {
    timeout(Duration::from_secs(5), conns.recv())
        .await
        .expect("client connected in time")
        .expect("broker still running")
}

// ---------------------------------------------------------------------------
// Frame plumbing over the stub broker socket
// ---------------------------------------------------------------------------

async fn send_frame(ws: &mut WebSocket, frame: &Frame) {
    let json = serde_json::to_string(frame).unwrap();
    ws.send(WsMessage::Text(json.into())).await.unwrap();
}

async fn send_request(ws: &mut WebSocket, id: &str, method: &str, path: &str) {
    send_request_with(ws, id, method, path, HashMap::new(), None).await;
}

async fn send_request_with(
    ws: &mut WebSocket,
    id: &str,
    method: &str,
    path: &str,
    headers: HashMap<String, String>,
    body: Option<String>,
) {
    send_frame(
        ws,
        &Frame::Request(RequestPayload {
            id: id.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            headers,
            body,
        }),
    )
    .await;
}

/// Reads the next protocol frame, skipping WebSocket control messages.
async fn recv_frame(ws: &mut WebSocket) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(10), ws.recv())
            .await
            .expect("frame arrived in time")
            .expect("socket still open")
            .expect("no socket error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("valid frame JSON");
        }
    }
}

async fn recv_response(ws: &mut WebSocket) -> ResponsePayload {
    match recv_frame(ws).await {
        Frame::Response(resp) => resp,
        other => panic!("expected response frame, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Origins
// ---------------------------------------------------------------------------

/// The classic 67-byte 1x1 transparent PNG.
const TINY_PNG: [u8; 67] = [
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
    0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0a, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0d, 0x0a, 0x2d, 0xb4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

fn gzip(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

async fn start_origin(app: Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// An address where nothing listens, for dead-origin tests.
async fn dead_origin_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    drop(listener);
    addr.port()
}

// ---------------------------------------------------------------------------
// Session helpers
// ---------------------------------------------------------------------------

fn test_config(broker_url: &str, origin_port: u16) -> TunnelConfig {
    let mut cfg = TunnelConfig::new(origin_port);
    cfg.local_host = "127.0.0.1".to_string();
    cfg.broker_url = broker_url.to_string();
    cfg
}

async fn open_session(cfg: TunnelConfig) -> Session {
    Session::open(cfg).await.expect("registration succeeds")
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn small_request_round_trip() {
    let origin = start_origin(Router::new().route("/ping", get(|| async { "pong" }))).await;
    let (broker_url, mut conns) = start_broker(200).await;

    let session = open_session(test_config(&broker_url, origin)).await;
    let mut ws = accept_tunnel(&mut conns).await;

    send_request(&mut ws, "r1", "GET", "/ping").await;
    let resp = recv_response(&mut ws).await;

    assert_eq!(resp.id, "r1");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, "pong");
    assert!(!resp.is_base64);
    assert!(
        resp.headers
            .get("content-type")
            .is_some_and(|ct| ct.starts_with("text/plain")),
        "unexpected headers: {:?}",
        resp.headers
    );

    session.close().await;
}

#[tokio::test]
async fn binary_response_travels_as_base64() {
    let origin = start_origin(Router::new().route(
        "/img.png",
        get(|| async { ([(header::CONTENT_TYPE, "image/png")], TINY_PNG.to_vec()) }),
    ))
    .await;
    let (broker_url, mut conns) = start_broker(200).await;

    let session = open_session(test_config(&broker_url, origin)).await;
    let mut ws = accept_tunnel(&mut conns).await;

    send_request(&mut ws, "r2", "GET", "/img.png").await;
    let resp = recv_response(&mut ws).await;

    assert_eq!(resp.status, 200);
    assert!(resp.is_base64);
    assert_eq!(resp.body, BASE64.encode(TINY_PNG));

    session.close().await;
}

#[tokio::test]
async fn gzip_html_is_served_decompressed() {
    let html = "<html><body>héllo tunnel</body></html>";
    let compressed = gzip(html.as_bytes());
    let origin = start_origin(Router::new().route(
        "/",
        get(move || {
            let compressed = compressed.clone();
            async move {
                (
                    [
                        (header::CONTENT_TYPE, "text/html; charset=utf-8"),
                        (header::CONTENT_ENCODING, "gzip"),
                    ],
                    compressed,
                )
            }
        }),
    ))
    .await;
    let (broker_url, mut conns) = start_broker(200).await;

    let session = open_session(test_config(&broker_url, origin)).await;
    let mut ws = accept_tunnel(&mut conns).await;

    send_request(&mut ws, "r3", "GET", "/").await;
    let resp = recv_response(&mut ws).await;

    assert_eq!(resp.status, 200);
    assert!(!resp.is_base64);
    assert_eq!(resp.body, html);
    assert!(!resp.headers.contains_key("content-encoding"));
    assert!(!resp.headers.contains_key("content-length"));

    session.close().await;
}

#[tokio::test]
async fn oversized_response_is_chunked() {
    // 1.5 MiB JSON body forces the response frame over the 1 MiB
    // message ceiling.
    let body = format!(r#"{{"data":"{}"}}"#, "x".repeat(1536 * 1024));
    let origin = {
        let body = body.clone();
        start_origin(Router::new().route(
            "/big",
            get(move || {
                let body = body.clone();
                async move { ([(header::CONTENT_TYPE, "application/json")], body) }
            }),
        ))
        .await
    };
    let (broker_url, mut conns) = start_broker(200).await;

    let session = open_session(test_config(&broker_url, origin)).await;
    let mut ws = accept_tunnel(&mut conns).await;

    send_request(&mut ws, "r4", "GET", "/big").await;

    // Collect the chunk series.
    let first = match recv_frame(&mut ws).await {
        Frame::Chunk(c) => c,
        other => panic!("expected chunk frame, got {:?}", other),
    };
    assert!(first.total_chunks > 1);
    assert_eq!(first.chunk_index, 0);
    assert_eq!(first.original_type, FrameKind::Response);

    let mut serialized = first.chunk.clone();
    for expected_index in 1..first.total_chunks {
        match recv_frame(&mut ws).await {
            Frame::Chunk(c) => {
                assert_eq!(c.message_id, first.message_id);
                assert_eq!(c.chunk_index, expected_index);
                assert_eq!(c.total_chunks, first.total_chunks);
                assert_eq!(c.original_type, FrameKind::Response);
                serialized.push_str(&c.chunk);
            }
            other => panic!("expected chunk frame, got {:?}", other),
        }
    }

    assert_eq!(
        first.total_chunks,
        serialized.len().div_ceil(chunks::CHUNK_BUDGET_BYTES)
    );

    let frame: Frame = serde_json::from_str(&serialized).expect("chunks reassemble to a frame");
    match frame {
        Frame::Response(resp) => {
            assert_eq!(resp.id, "r4");
            assert_eq!(resp.body, body);
            assert!(!resp.is_base64);
        }
        other => panic!("expected response frame, got {:?}", other),
    }

    session.close().await;
}

#[tokio::test]
async fn chunked_inbound_request_is_reassembled() {
    let origin = start_origin(Router::new().route(
        "/len",
        post(|body: String| async move { body.len().to_string() }),
    ))
    .await;
    let (broker_url, mut conns) = start_broker(200).await;

    let session = open_session(test_config(&broker_url, origin)).await;
    let mut ws = accept_tunnel(&mut conns).await;

    let big_body = "a".repeat(2 * 1024 * 1024);
    let request = Frame::Request(RequestPayload {
        id: "r5".to_string(),
        method: "POST".to_string(),
        path: "/len".to_string(),
        headers: HashMap::new(),
        body: Some(big_body.clone()),
    });

    // Deliver the chunk series in reverse to exercise out-of-order
    // reassembly end to end.
    let messages = chunks::encode_frame(&request).unwrap();
    assert!(messages.len() > 1);
    for msg in messages.into_iter().rev() {
        ws.send(WsMessage::Text(msg.into())).await.unwrap();
    }

    let resp = recv_response(&mut ws).await;
    assert_eq!(resp.id, "r5");
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, big_body.len().to_string());

    session.close().await;
}

#[tokio::test]
async fn circuit_breaker_trips_after_five_failures() {
    let origin = dead_origin_port().await;
    let (broker_url, mut conns) = start_broker(200).await;

    let mut cfg = test_config(&broker_url, origin);
    // No retries: each relayed request burns exactly one failure.
    cfg.max_retries = 0;

    let session = open_session(cfg).await;
    let mut ws = accept_tunnel(&mut conns).await;

    for i in 0..5 {
        let id = format!("dead-{}", i);
        send_request(&mut ws, &id, "GET", "/anything").await;
        let resp = recv_response(&mut ws).await;
        assert_eq!(resp.id, id);
        assert_eq!(resp.status, 502, "request {} should fail with 502", i);
        assert_eq!(
            resp.headers.get("X-Error-Type").map(String::as_str),
            Some("connection-refused")
        );
    }

    // The breaker is open now: instant 503 without touching the origin.
    send_request(&mut ws, "rejected", "GET", "/anything").await;
    let resp = recv_response(&mut ws).await;
    assert_eq!(resp.status, 503);
    assert_eq!(
        resp.headers.get("X-Error-Type").map(String::as_str),
        Some("circuit-breaker-open")
    );
    assert_eq!(
        resp.headers.get("Retry-After").map(String::as_str),
        Some("30")
    );
    let body: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
    assert_eq!(body["errorType"], "circuit-breaker-open");
    assert_eq!(body["retryAfterSeconds"], 30);

    session.close().await;
}

#[tokio::test]
async fn breaker_events_reach_the_embedder() {
    let origin = dead_origin_port().await;
    let (broker_url, mut conns) = start_broker(200).await;

    let mut cfg = test_config(&broker_url, origin);
    cfg.max_retries = 0;

    let mut session = open_session(cfg).await;
    let mut events = session.take_events().unwrap();
    let mut ws = accept_tunnel(&mut conns).await;

    for i in 0..5 {
        send_request(&mut ws, &format!("d{}", i), "GET", "/x").await;
        recv_response(&mut ws).await;
    }

    let mut saw_open = false;
    while let Ok(Some(event)) = timeout(Duration::from_secs(2), events.recv()).await {
        if let SessionEvent::CircuitBreakerOpen {
            consecutive_errors, ..
        } = event
        {
            assert_eq!(consecutive_errors, 5);
            saw_open = true;
            break;
        }
    }
    assert!(saw_open, "breaker open event was never emitted");

    session.close().await;
}

#[tokio::test]
async fn sse_stream_is_relayed_in_order() {
    use axum::http::StatusCode;

    let origin = start_origin(Router::new().route(
        "/events",
        get(|| async {
            let parts = futures_util::stream::iter(["data: a\n\n", "data: b\n\n"]).then(
                |part| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(part))
                },
            );
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(parts))
                .unwrap()
        }),
    ))
    .await;
    let (broker_url, mut conns) = start_broker(200).await;

    let session = open_session(test_config(&broker_url, origin)).await;
    let mut ws = accept_tunnel(&mut conns).await;

    let mut headers = HashMap::new();
    headers.insert("Accept".to_string(), "text/event-stream".to_string());
    send_request_with(&mut ws, "s1", "GET", "/events", headers, None).await;

    match recv_frame(&mut ws).await {
        Frame::SseStart(start) => {
            assert_eq!(start.request_id, "s1");
            assert_eq!(start.status, 200);
            assert!(
                start
                    .headers
                    .get("content-type")
                    .is_some_and(|ct| ct.contains("text/event-stream"))
            );
        }
        other => panic!("expected sse-start, got {:?}", other),
    }

    let mut streamed = String::new();
    loop {
        match recv_frame(&mut ws).await {
            Frame::SseChunk(chunk) => {
                assert_eq!(chunk.request_id, "s1");
                streamed.push_str(&chunk.chunk);
            }
            Frame::SseEnd(end) => {
                assert_eq!(end.request_id, "s1");
                assert_eq!(end.reason.as_deref(), Some("stream_ended"));
                break;
            }
            other => panic!("expected sse frames, got {:?}", other),
        }
    }
    assert_eq!(streamed, "data: a\n\ndata: b\n\n");

    session.close().await;
}

#[tokio::test]
async fn broker_ping_is_answered_with_pong() {
    let origin = start_origin(Router::new()).await;
    let (broker_url, mut conns) = start_broker(200).await;

    let session = open_session(test_config(&broker_url, origin)).await;
    let mut ws = accept_tunnel(&mut conns).await;

    send_frame(
        &mut ws,
        &Frame::Ping(localrun::protocol::PingPayload { timestamp: 12345 }),
    )
    .await;

    match recv_frame(&mut ws).await {
        Frame::Pong(pong) => assert!(pong.timestamp > 0),
        other => panic!("expected pong, got {:?}", other),
    }

    session.close().await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registration_failure_surfaces_broker_message() {
    let (broker_url, _conns) = start_broker(503).await;

    let err = Session::open(test_config(&broker_url, 3000))
        .await
        .expect_err("registration should fail");
    assert!(
        err.to_string().contains("no capacity left"),
        "unexpected error: {}",
        err
    );
}

#[tokio::test]
async fn registration_with_subdomain_posts_to_the_broker() {
    let origin = start_origin(Router::new()).await;
    let (broker_url, mut conns) = start_broker(200).await;

    let mut cfg = test_config(&broker_url, origin);
    cfg.subdomain = Some("abcde12345".to_string());

    let session = open_session(cfg).await;
    assert_eq!(session.info().id, "t1");
    assert_eq!(session.url(), "https://t1.tunnel.test");

    // The WebSocket still comes up on the assigned id.
    let _ws = accept_tunnel(&mut conns).await;
    session.close().await;
}

#[tokio::test]
async fn invalid_subdomain_fails_before_any_network() {
    let mut cfg = TunnelConfig::new(3000);
    cfg.broker_url = "http://127.0.0.1:1".to_string();
    cfg.subdomain = Some("bad".to_string());

    let err = Session::open(cfg).await.expect_err("validation should fail");
    assert!(err.to_string().contains("subdomain"));
}

#[tokio::test]
async fn close_is_idempotent_and_emits_one_event() {
    let origin = start_origin(Router::new()).await;
    let (broker_url, mut conns) = start_broker(200).await;

    let mut session = open_session(test_config(&broker_url, origin)).await;
    let mut events = session.take_events().unwrap();
    let _ws = accept_tunnel(&mut conns).await;

    session.close().await;
    session.close().await;
    assert!(session.is_closed());

    let mut closed_events = 0;
    loop {
        match timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Some(SessionEvent::Closed)) => closed_events += 1,
            Ok(Some(_)) => {}
            // Quiet for half a second: nothing else is coming.
            Err(_) | Ok(None) => break,
        }
    }
    assert_eq!(closed_events, 1);
}

#[tokio::test]
async fn graceful_shutdown_closes_the_session() {
    let origin = start_origin(Router::new()).await;
    let (broker_url, mut conns) = start_broker(200).await;

    let session = open_session(test_config(&broker_url, origin)).await;
    let _ws = accept_tunnel(&mut conns).await;

    timeout(Duration::from_secs(6), session.graceful_shutdown())
        .await
        .expect("shutdown completes within the drain budget");
    assert!(session.is_closed());
}

#[tokio::test]
async fn url_event_is_emitted_on_connect() {
    let origin = start_origin(Router::new()).await;
    let (broker_url, mut conns) = start_broker(200).await;

    let mut session = open_session(test_config(&broker_url, origin)).await;
    let mut events = session.take_events().unwrap();
    let _ws = accept_tunnel(&mut conns).await;

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event in time")
        .expect("channel open");
    assert_eq!(
        event,
        SessionEvent::Url("https://t1.tunnel.test".to_string())
    );

    session.close().await;
}
