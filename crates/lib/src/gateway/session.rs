//! Session controller: the gateway state machine and its supervisory loop.
//!
//! One [`GatewayClient::run`] call owns the connection for its whole life.
//! Each connection attempt goes Connecting -> AwaitingHello -> Handshaking ->
//! Connected and ends with a [`Flow`] that tells the supervisor whether to
//! reconnect (with or without resume), give up, or stop. Per connection there
//! is one receive loop (here) and one heartbeat task; they share only the
//! [`SharedSession`] and the heartbeat's ack slot.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::GatewayConfig;
use crate::error::{DecodeError, GatewayError};
use crate::events::EventRouter;
use crate::gateway::codec::FrameDecoder;
use crate::gateway::heartbeat::{Heartbeat, PayloadSink};
use crate::gateway::protocol::{
    GatewayPayload, Hello, Identify, IdentifyProperties, OpCode, Ready, Resume,
};
use crate::http::HttpClient;

/// Resumable identity of one gateway session.
#[derive(Clone, Default)]
pub struct Session {
    pub session_id: Option<String>,
    /// Highest dispatch sequence seen. Never decreases until the session is invalidated.
    pub sequence: Option<u64>,
    pub shard: Option<[u32; 2]>,
    pub heartbeat_interval: Option<Duration>,
    /// `resume_gateway_url` from READY.
    pub resume_url: Option<String>,
    credential: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("sequence", &self.sequence)
            .field("shard", &self.shard)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("resume_url", &self.resume_url)
            .field("credential", &"<redacted>")
            .finish()
    }
}

impl Session {
    pub fn new(credential: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            ..Self::default()
        }
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// Apply a payload's `s`. Absent or older values leave the sequence alone.
    pub fn apply_sequence(&mut self, s: Option<u64>) {
        if let Some(s) = s {
            if self.sequence.map_or(true, |cur| s > cur) {
                self.sequence = Some(s);
            }
        }
    }

    fn ready(&mut self, ready: Ready) {
        self.session_id = Some(ready.session_id);
        if ready.resume_gateway_url.is_some() {
            self.resume_url = ready.resume_gateway_url;
        }
    }

    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }

    /// Forget the session; the next handshake identifies from scratch.
    pub fn invalidate(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_url = None;
    }
}

/// The session shared between the receive loop and the heartbeat task.
#[derive(Debug, Clone)]
pub struct SharedSession(Arc<Mutex<Session>>);

impl SharedSession {
    pub fn new(session: Session) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn sequence(&self) -> Option<u64> {
        self.with(|s| s.sequence)
    }

    pub fn snapshot(&self) -> Session {
        self.with(|s| s.clone())
    }
}

/// Lifecycle notifications published on [`GatewayClient::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    AwaitingHello,
    Handshaking,
    Connected,
    Reconnecting,
    Closed,
}

/// Outcome of one step of the receive loop, and of a whole connection attempt.
#[derive(Debug)]
pub enum Flow {
    Continue,
    Reconnect { resume: bool },
    Fatal(GatewayError),
    /// Shut down on request. Terminal.
    Closed,
}

/// What the receive loop should do with one decoded payload, after the
/// session has been updated from it.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Dispatch { name: String, data: Value },
    Ack,
    Beat,
    Reconnect { resume: bool },
    Ignore,
}

/// Update the session from one inbound payload and decide what happens next.
pub fn route_payload(session: &mut Session, payload: GatewayPayload) -> Directive {
    session.apply_sequence(payload.s);
    match payload.opcode() {
        Some(OpCode::Dispatch) => {
            let Some(name) = payload.t else {
                log::warn!("dispatch without event name (s={:?}), skipped", payload.s);
                return Directive::Ignore;
            };
            match name.as_str() {
                "READY" => match Ready::deserialize(&payload.d) {
                    Ok(ready) => {
                        log::info!("session ready: {}", ready.session_id);
                        session.ready(ready);
                    }
                    Err(e) => log::warn!("malformed READY: {}", e),
                },
                "RESUMED" => log::info!("session resumed at sequence {:?}", session.sequence),
                _ => {}
            }
            Directive::Dispatch {
                name,
                data: payload.d,
            }
        }
        Some(OpCode::HeartbeatAck) => Directive::Ack,
        Some(OpCode::Heartbeat) => Directive::Beat,
        Some(OpCode::Reconnect) => {
            log::info!("gateway requested reconnect");
            Directive::Reconnect { resume: true }
        }
        Some(OpCode::InvalidateSession) => {
            if payload.d.as_bool() == Some(true) {
                log::info!("session invalidated (resumable)");
                Directive::Reconnect { resume: true }
            } else {
                log::info!("session invalidated, will identify again");
                session.invalidate();
                Directive::Reconnect { resume: false }
            }
        }
        Some(op) => {
            log::debug!("ignoring {:?} while connected", op);
            Directive::Ignore
        }
        None => {
            log::debug!("ignoring unknown opcode {}", payload.op);
            Directive::Ignore
        }
    }
}

/// Decide what a close code from the gateway means for the session.
pub fn classify_close(code: u16, reason: &str) -> Flow {
    match code {
        4004 => Flow::Fatal(GatewayError::AuthenticationFailed),
        4010..=4014 => Flow::Fatal(GatewayError::Closed {
            code,
            reason: reason.to_string(),
        }),
        4007 | 4009 => Flow::Reconnect { resume: false },
        _ => Flow::Reconnect { resume: true },
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the socket. Shared by the receive loop and the heartbeat task.
struct SocketSink {
    write: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
}

impl SocketSink {
    fn new(write: SplitSink<WsStream, Message>) -> Self {
        Self {
            write: tokio::sync::Mutex::new(write),
        }
    }

    async fn close(&self, code: u16) {
        let mut write = self.write.lock().await;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        if let Err(e) = write.send(Message::Close(Some(frame))).await {
            log::debug!("close frame not sent: {}", e);
        }
        let _ = write.close().await;
    }
}

#[async_trait]
impl PayloadSink for SocketSink {
    async fn send(&self, payload: &GatewayPayload) -> Result<(), GatewayError> {
        let text = serde_json::to_string(payload).map_err(DecodeError::from)?;
        log::trace!("send op {}", payload.op);
        self.write.lock().await.send(Message::Text(text)).await?;
        Ok(())
    }
}

/// Requests a clean shutdown of a running [`GatewayClient`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        // every handle dropped: nobody can ask for shutdown any more
        std::future::pending::<()>().await;
    }
}

/// Read frames until one decodes to a payload. Anything that ends the
/// connection comes back as the [`Flow`] to follow.
async fn next_payload(
    read: &mut SplitStream<WsStream>,
    decoder: &mut FrameDecoder,
) -> Result<GatewayPayload, Flow> {
    loop {
        let msg = match read.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                log::warn!("gateway transport error: {}", e);
                return Err(Flow::Reconnect { resume: true });
            }
            None => {
                log::warn!("gateway stream ended");
                return Err(Flow::Reconnect { resume: true });
            }
        };
        let decoded = match msg {
            Message::Text(text) => decoder.feed(text.as_bytes(), false),
            Message::Binary(bytes) => decoder.feed(&bytes, true),
            Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.into_owned()))
                    .unwrap_or((1005, String::new()));
                log::warn!("gateway closed the connection: {} {}", code, reason);
                return Err(classify_close(code, &reason));
            }
            _ => continue,
        };
        match decoded {
            Ok(Some(payload)) => return Ok(payload),
            Ok(None) => continue,
            Err(DecodeError::Json(e)) => log::warn!("skipping malformed payload: {}", e),
            Err(e) => {
                // the inflate context is unusable after this
                log::warn!("gateway stream corrupted: {}", e);
                return Err(Flow::Reconnect { resume: true });
            }
        }
    }
}

fn close_code_for(flow: &Flow) -> u16 {
    match flow {
        // a non-1000 close keeps the session resumable on the server
        Flow::Reconnect { resume: true } => 4000,
        _ => 1000,
    }
}

/// Gateway connection with automatic reconnect.
pub struct GatewayClient {
    settings: GatewayConfig,
    http: HttpClient,
    router: EventRouter,
    session: SharedSession,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
    failures: u32,
}

impl GatewayClient {
    pub fn new(
        settings: GatewayConfig,
        token: impl Into<String>,
        http: HttpClient,
        router: EventRouter,
    ) -> (Self, ShutdownHandle) {
        let mut session = Session::new(token);
        session.shard = settings.shard;
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (stop_tx, stop_rx) = watch::channel(false);
        let client = Self {
            settings,
            http,
            router,
            session: SharedSession::new(session),
            state,
            shutdown: stop_rx,
            failures: 0,
        };
        (client, ShutdownHandle(Arc::new(stop_tx)))
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    fn set_state(&self, state: ConnectionState) {
        log::debug!("gateway state: {:?}", state);
        self.state.send_replace(state);
    }

    /// Run until shutdown or a fatal error. Reconnects on everything else.
    pub async fn run(&mut self) -> Result<(), GatewayError> {
        let mut resume = true;
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                self.set_state(ConnectionState::Closed);
                return Ok(());
            }
            match self.connect_once(resume).await {
                Flow::Closed => {
                    log::info!("gateway closed on request");
                    self.set_state(ConnectionState::Closed);
                    return Ok(());
                }
                Flow::Fatal(e) => {
                    log::error!("gateway session cannot continue: {}", e);
                    self.set_state(ConnectionState::Closed);
                    return Err(e);
                }
                Flow::Reconnect { resume: r } => {
                    resume = r;
                    if !r {
                        self.session.with(Session::invalidate);
                    }
                }
                Flow::Continue => resume = true,
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = self.settings.reconnect_delay(self.failures);
            self.failures = self.failures.saturating_add(1);
            log::info!("reconnecting in {:?} (resume: {})", delay, resume);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => {}
            }
        }
    }

    async fn connect_once(&mut self, resume: bool) -> Flow {
        self.set_state(ConnectionState::Connecting);
        let resuming = resume && self.session.with(|s| s.can_resume());
        let mut shutdown = self.shutdown.clone();
        let limit = self.settings.connect_timeout();

        let discovered = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => return Flow::Closed,
            r = tokio::time::timeout(limit, self.discover(resuming)) => r,
        };
        let (base, start_wait) = match discovered {
            Ok(Ok(found)) => found,
            Ok(Err(flow)) => return flow,
            Err(_) => {
                log::warn!("gateway discovery timed out after {:?}", limit);
                return Flow::Reconnect { resume: true };
            }
        };
        if let Some(wait) = start_wait {
            log::warn!("session start limit exhausted, identifying in {:?}", wait);
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => return Flow::Closed,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let url = self.settings.connect_url(&base);
        log::info!("connecting to {}", url);
        let opened = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => return Flow::Closed,
            r = tokio::time::timeout(limit, tokio_tungstenite::connect_async(url.as_str())) => r,
        };
        let ws = match opened {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                log::warn!("gateway connect failed: {}", e);
                return Flow::Reconnect { resume: true };
            }
            Err(_) => {
                log::warn!("gateway upgrade timed out after {:?}", limit);
                return Flow::Reconnect { resume: true };
            }
        };
        let (write, read) = ws.split();
        let sink = Arc::new(SocketSink::new(write));
        let mut heartbeat = Heartbeat::new(
            sink.clone(),
            self.session.clone(),
            self.settings.ack_timeout(),
        );

        let flow = self.drive(read, &mut heartbeat, sink.as_ref(), resuming).await;

        heartbeat.stop().await;
        sink.close(close_code_for(&flow)).await;
        flow
    }

    /// Find the URL to connect to, and how long a new IDENTIFY must wait for
    /// the session start budget. Resumes go to READY's resume URL when known.
    async fn discover(&self, resuming: bool) -> Result<(String, Option<Duration>), Flow> {
        if resuming {
            if let Some(url) = self.session.with(|s| s.resume_url.clone()) {
                return Ok((url, None));
            }
        }
        let info = match self.http.gateway_bot().await {
            Ok(info) => info,
            Err(e) if e.is_unauthorized() => {
                return Err(Flow::Fatal(GatewayError::AuthenticationFailed))
            }
            Err(e) => {
                log::warn!("gateway discovery failed: {}", e);
                return Err(Flow::Reconnect { resume: true });
            }
        };
        let limit = &info.session_start_limit;
        let wait = (!resuming && limit.remaining == 0).then(|| Duration::from_millis(limit.reset_after));
        Ok((info.url, wait))
    }

    async fn drive(
        &mut self,
        mut read: SplitStream<WsStream>,
        heartbeat: &mut Heartbeat,
        sink: &SocketSink,
        resuming: bool,
    ) -> Flow {
        let mut decoder = FrameDecoder::new();
        let mut shutdown = self.shutdown.clone();

        self.set_state(ConnectionState::AwaitingHello);
        let first = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => return Flow::Closed,
            r = tokio::time::timeout(
                self.settings.hello_timeout(),
                next_payload(&mut read, &mut decoder),
            ) => r,
        };
        let first = match first {
            Ok(Ok(payload)) => payload,
            Ok(Err(flow)) => return flow,
            Err(_) => {
                log::warn!("no HELLO within {:?}", self.settings.hello_timeout());
                return Flow::Reconnect { resume: true };
            }
        };
        if first.opcode() != Some(OpCode::Hello) {
            log::warn!("expected HELLO, got op {}", first.op);
            return Flow::Reconnect { resume: true };
        }
        let hello = match Hello::deserialize(&first.d) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("malformed HELLO: {}", e);
                return Flow::Reconnect { resume: true };
            }
        };
        let interval = Duration::from_millis(hello.heartbeat_interval);
        self.session.with(|s| s.heartbeat_interval = Some(interval));

        self.set_state(ConnectionState::Handshaking);
        let handshake = self.handshake_payload(resuming);
        if let Err(e) = heartbeat.start(interval) {
            return Flow::Fatal(e.into());
        }
        if let Err(e) = sink.send(&handshake).await {
            log::warn!("handshake send failed: {}", e);
            return Flow::Reconnect { resume: true };
        }
        self.set_state(ConnectionState::Connected);

        loop {
            let step = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => Flow::Closed,
                _ = heartbeat.expired() => Flow::Reconnect { resume: true },
                next = next_payload(&mut read, &mut decoder) => match next {
                    Ok(payload) => self.handle(payload, heartbeat).await,
                    Err(flow) => flow,
                },
            };
            if !matches!(step, Flow::Continue) {
                return step;
            }
        }
    }

    async fn handle(&mut self, payload: GatewayPayload, heartbeat: &Heartbeat) -> Flow {
        match self.session.with(|s| route_payload(s, payload)) {
            Directive::Dispatch { name, data } => {
                if name == "READY" || name == "RESUMED" {
                    // the gateway accepted the handshake
                    self.failures = 0;
                }
                self.router.dispatch(&name, &data);
                Flow::Continue
            }
            Directive::Ack => {
                heartbeat.ack();
                Flow::Continue
            }
            Directive::Beat => match heartbeat.force_beat().await {
                Ok(()) => Flow::Continue,
                Err(e) => {
                    log::warn!("requested heartbeat failed: {}", e);
                    Flow::Reconnect { resume: true }
                }
            },
            Directive::Reconnect { resume } => Flow::Reconnect { resume },
            Directive::Ignore => Flow::Continue,
        }
    }

    /// RESUME when asked for and possible, otherwise IDENTIFY. Identifying
    /// starts a new session, so the old sequence is dropped before any beat.
    fn handshake_payload(&self, resuming: bool) -> GatewayPayload {
        if let Some(resume) = self.resume_payload().filter(|_| resuming) {
            log::info!("resuming session");
            return resume;
        }
        log::info!("identifying");
        self.session.with(Session::invalidate);
        self.identify_payload()
    }

    fn identify_payload(&self) -> GatewayPayload {
        let (token, shard) = self.session.with(|s| (s.credential().to_string(), s.shard));
        GatewayPayload::identify(&Identify {
            token,
            properties: IdentifyProperties::default(),
            compress: false,
            large_threshold: self.settings.large_threshold,
            shard,
            intents: self.settings.intents,
        })
    }

    fn resume_payload(&self) -> Option<GatewayPayload> {
        self.session.with(|s| {
            Some(GatewayPayload::resume(&Resume {
                token: s.credential().to_string(),
                session_id: s.session_id.clone()?,
                seq: s.sequence,
            }))
        })
    }
}
