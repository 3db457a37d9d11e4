//! Integration test: run the gateway client against an in-process mock
//! gateway (REST discovery + WebSocket on one free port) and check the
//! handshake, resume after a resumable invalidation, re-identify after a
//! non-resumable one, resume after a missed heartbeat ack, zlib-stream
//! transport, fatal close codes, and a gateway that never finishes the upgrade.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wumpus::config::{Compression, Config};
use wumpus::error::GatewayError;
use wumpus::events::{ChannelHandler, DispatchEvent, EventKind, EventRouter};
use wumpus::gateway::{ConnectionState, FrameEncoder, GatewayClient, GatewayPayload, ShutdownHandle};
use wumpus::http::HttpClient;

const TOKEN: &str = "gateway-test-token";

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    /// Send INVALIDATE_SESSION with this payload after the first dispatches.
    Invalidate(bool),
    /// Close right after HELLO with this code.
    CloseWith(u16),
    /// Reject discovery with 401.
    Unauthorized,
    /// Answer everything except heartbeats.
    SilentAcks,
    /// Point discovery at this port, where connections are accepted and never answered.
    Stalled(u16),
}

#[derive(Clone)]
struct MockGateway {
    port: u16,
    mode: Mode,
    compress: bool,
    connections: Arc<AtomicUsize>,
    frames: mpsc::UnboundedSender<(usize, Value)>,
}

fn op(op: u8, d: Value) -> GatewayPayload {
    GatewayPayload { op, d, s: None, t: None }
}

fn dispatch(name: &str, s: u64, d: Value) -> GatewayPayload {
    GatewayPayload {
        op: 0,
        d,
        s: Some(s),
        t: Some(name.to_string()),
    }
}

async fn gateway_bot(State(mock): State<MockGateway>) -> Response {
    if let Mode::Unauthorized = mock.mode {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "code": 0, "message": "401: Unauthorized" })))
            .into_response();
    }
    let port = match mock.mode {
        Mode::Stalled(port) => port,
        _ => mock.port,
    };
    Json(json!({
        "url": format!("ws://127.0.0.1:{}", port),
        "shards": 1,
        "session_start_limit": { "total": 1000, "remaining": 999, "reset_after": 0, "max_concurrency": 1 }
    }))
    .into_response()
}

async fn ws_handler(State(mock): State<MockGateway>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_session(socket, mock))
}

/// Send one payload; compressed payloads go out split across two binary frames.
async fn send(socket: &mut WebSocket, encoder: &mut Option<FrameEncoder>, payload: GatewayPayload) -> bool {
    match encoder {
        Some(enc) => {
            let bytes = enc.encode_binary(&payload).expect("encode");
            let mid = bytes.len() / 2;
            socket.send(Message::Binary(bytes[..mid].to_vec())).await.is_ok()
                && socket.send(Message::Binary(bytes[mid..].to_vec())).await.is_ok()
        }
        None => {
            let text = serde_json::to_string(&payload).expect("json");
            socket.send(Message::Text(text)).await.is_ok()
        }
    }
}

async fn serve_session(mut socket: WebSocket, mock: MockGateway) {
    let conn = mock.connections.fetch_add(1, Ordering::SeqCst);
    let mut encoder = mock.compress.then(FrameEncoder::new);
    let resume_url = format!("ws://127.0.0.1:{}", mock.port);

    if !send(&mut socket, &mut encoder, op(10, json!({ "heartbeat_interval": 45000 }))).await {
        return;
    }
    if let Mode::CloseWith(code) = mock.mode {
        let frame = CloseFrame {
            code,
            reason: "closing".into(),
        };
        let _ = socket.send(Message::Close(Some(frame))).await;
        return;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else { continue };
        let payload: Value = serde_json::from_str(&text).expect("client sends JSON");
        let _ = mock.frames.send((conn, payload.clone()));
        match payload["op"].as_u64() {
            Some(1) if !matches!(mock.mode, Mode::SilentAcks) => {
                send(&mut socket, &mut encoder, op(11, Value::Null)).await;
            }
            Some(2) => {
                let ready = json!({
                    "v": 10,
                    "session_id": "sess-1",
                    "resume_gateway_url": resume_url,
                    "user": { "id": "1", "username": "bot" }
                });
                send(&mut socket, &mut encoder, dispatch("READY", 1, ready)).await;
                send(
                    &mut socket,
                    &mut encoder,
                    dispatch("MESSAGE_CREATE", 2, json!({ "id": "2", "content": "hi" })),
                )
                .await;
                if let (0, Mode::Invalidate(resumable)) = (conn, mock.mode) {
                    send(&mut socket, &mut encoder, op(9, json!(resumable))).await;
                }
            }
            Some(6) => {
                send(&mut socket, &mut encoder, dispatch("RESUMED", 3, Value::Null)).await;
            }
            _ => {}
        }
    }
}

struct Harness {
    frames: mpsc::UnboundedReceiver<(usize, Value)>,
    events: mpsc::UnboundedReceiver<DispatchEvent>,
    states: tokio::sync::watch::Receiver<ConnectionState>,
    shutdown: ShutdownHandle,
    run: JoinHandle<Result<(), GatewayError>>,
}

async fn start(mode: Mode, compress: bool) -> Harness {
    start_with(mode, compress, |_| {}).await
}

async fn start_with(mode: Mode, compress: bool, tweak: impl FnOnce(&mut Config)) -> Harness {
    let port = free_port();
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let mock = MockGateway {
        port,
        mode,
        compress,
        connections: Arc::new(AtomicUsize::new(0)),
        frames: frames_tx,
    };
    let app = Router::new()
        .route("/api/v10/gateway/bot", get(gateway_bot))
        .route("/", get(ws_handler))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("bind mock gateway");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let mut config = Config::default();
    config.api.base_url = Some(format!("http://127.0.0.1:{}/api/v10", port));
    config.gateway.compress = if compress { Compression::ZlibStream } else { Compression::None };
    config.gateway.reconnect_delay_ms = 10;
    config.gateway.hello_timeout_ms = 5000;
    tweak(&mut config);

    let http = HttpClient::new(
        config.api.base_url.clone().unwrap_or_default(),
        Some(TOKEN.to_string()),
        config.api.clone(),
    );
    let (events_tx, events) = mpsc::unbounded_channel();
    let router = EventRouter::new().on_any(ChannelHandler(events_tx));
    let (mut client, shutdown) = GatewayClient::new(config.gateway.clone(), TOKEN, http, router);
    let states = client.subscribe();
    let run = tokio::spawn(async move { client.run().await });
    Harness {
        frames,
        events,
        states,
        shutdown,
        run,
    }
}

/// Collect client frames until `done` matches one, returning everything seen.
async fn frames_until(
    rx: &mut mpsc::UnboundedReceiver<(usize, Value)>,
    done: impl Fn(usize, &Value) -> bool,
) -> Vec<(usize, Value)> {
    let mut seen = Vec::new();
    loop {
        let (conn, frame) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("frame within 10s")
            .expect("mock still running");
        let stop = done(conn, &frame);
        seen.push((conn, frame));
        if stop {
            return seen;
        }
    }
}

/// A TCP listener that accepts connections, holds them open, and never writes a byte.
async fn stalled_listener() -> (u16, Arc<AtomicUsize>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stalled listener");
    let port = listener.local_addr().expect("local_addr").port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = accepted.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            held.push(socket);
        }
    });
    (port, accepted)
}

async fn wait_for_count(counter: &AtomicUsize, at_least: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while counter.load(Ordering::SeqCst) < at_least {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connection attempts within 10s");
}

fn is_handshake_on(conn: usize) -> impl Fn(usize, &Value) -> bool {
    move |c, f| c == conn && matches!(f["op"].as_u64(), Some(2) | Some(6))
}

async fn stop(h: Harness) {
    h.shutdown.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), h.run)
        .await
        .expect("run ends after shutdown")
        .expect("run task");
    assert!(result.is_ok(), "run failed: {:?}", result);
    assert_eq!(*h.states.borrow(), ConnectionState::Closed);
}

#[tokio::test]
async fn resumable_invalidation_resumes_with_stored_session() {
    let mut h = start(Mode::Invalidate(true), false).await;
    let seen = frames_until(&mut h.frames, is_handshake_on(1)).await;

    let first = seen.iter().filter(|(c, _)| *c == 0);
    let ops: Vec<u64> = first.filter_map(|(_, f)| f["op"].as_u64()).collect();
    assert!(ops.contains(&1), "immediate heartbeat on first connection");
    assert!(ops.contains(&2), "identify on first connection");

    let (_, resume) = seen.last().expect("resume frame");
    assert_eq!(resume["op"], 6);
    assert_eq!(resume["d"]["token"], TOKEN);
    assert_eq!(resume["d"]["session_id"], "sess-1");
    assert_eq!(resume["d"]["seq"], 2);

    let ready = h.events.recv().await.expect("READY");
    assert_eq!(ready.kind, EventKind::Ready);
    let message = h.events.recv().await.expect("MESSAGE_CREATE");
    assert_eq!(message.kind, EventKind::MessageCreate);
    assert_eq!(message.payload["content"], "hi");
    stop(h).await;
}

#[tokio::test]
async fn non_resumable_invalidation_identifies_again() {
    let mut h = start(Mode::Invalidate(false), false).await;
    let seen = frames_until(&mut h.frames, is_handshake_on(1)).await;

    let (_, handshake) = seen.last().expect("handshake frame");
    assert_eq!(handshake["op"], 2);
    assert_eq!(handshake["d"]["token"], TOKEN);
    assert!(seen.iter().all(|(_, f)| f["op"] != 6), "never resumed");
    stop(h).await;
}

#[tokio::test]
async fn compressed_transport_delivers_events() {
    let mut h = start(Mode::Invalidate(true), true).await;
    let seen = frames_until(&mut h.frames, is_handshake_on(1)).await;
    let (_, resume) = seen.last().expect("resume frame");
    assert_eq!(resume["op"], 6);
    assert_eq!(resume["d"]["seq"], 2);

    let ready = h.events.recv().await.expect("READY");
    assert_eq!(ready.payload["session_id"], "sess-1");
    stop(h).await;
}

#[tokio::test]
async fn authentication_close_is_fatal() {
    let h = start(Mode::CloseWith(4004), false).await;
    let result = tokio::time::timeout(Duration::from_secs(10), h.run)
        .await
        .expect("run ends")
        .expect("run task");
    assert!(matches!(result, Err(GatewayError::AuthenticationFailed)));
    assert_eq!(*h.states.borrow(), ConnectionState::Closed);
}

#[tokio::test]
async fn disallowed_intents_close_is_fatal() {
    let h = start(Mode::CloseWith(4014), false).await;
    let result = tokio::time::timeout(Duration::from_secs(10), h.run)
        .await
        .expect("run ends")
        .expect("run task");
    assert!(matches!(result, Err(GatewayError::Closed { code: 4014, .. })));
}

#[tokio::test]
async fn rejected_token_stops_before_connecting() {
    let h = start(Mode::Unauthorized, false).await;
    let result = tokio::time::timeout(Duration::from_secs(10), h.run)
        .await
        .expect("run ends")
        .expect("run task");
    assert!(matches!(result, Err(GatewayError::AuthenticationFailed)));
}

#[tokio::test]
async fn missed_heartbeat_ack_resumes_on_a_new_connection() {
    let mut h = start_with(Mode::SilentAcks, false, |c| c.gateway.ack_timeout_ms = 200).await;
    let seen = frames_until(&mut h.frames, is_handshake_on(1)).await;

    assert!(
        seen.iter().any(|(c, f)| *c == 0 && f["op"] == 1),
        "heartbeat sent on the first connection"
    );
    let (_, resume) = seen.last().expect("resume frame");
    assert_eq!(resume["op"], 6);
    assert_eq!(resume["d"]["session_id"], "sess-1");
    assert_eq!(resume["d"]["seq"], 2);
    stop(h).await;
}

#[tokio::test]
async fn shutdown_interrupts_a_stalled_upgrade() {
    let (stalled, accepted) = stalled_listener().await;
    let h = start_with(Mode::Stalled(stalled), false, |c| c.gateway.connect_timeout_ms = 60_000).await;
    wait_for_count(&accepted, 1).await;
    assert_eq!(*h.states.borrow(), ConnectionState::Connecting);
    stop(h).await;
}

#[tokio::test]
async fn stalled_upgrade_times_out_and_reconnects() {
    let (stalled, accepted) = stalled_listener().await;
    let h = start_with(Mode::Stalled(stalled), false, |c| c.gateway.connect_timeout_ms = 200).await;
    wait_for_count(&accepted, 3).await;
    stop(h).await;
}
