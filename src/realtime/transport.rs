//! Transport session: one duplex Socket.IO connection.
//!
//! A session reports upward through its [`SessionSink`]: at most one
//! `Connected`, any number of `Event`s, then exactly one terminal signal
//! (`HandshakeFailed` or `Closed`). The sink drops everything after the
//! terminal signal and everything once the owner has detached it, so a
//! disposed session can never leak callbacks into the manager.
//!
//! Sessions never reconnect on their own. Reconnection belongs to the
//! scheduler.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::WebSocketConfig, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::{
    credentials::Credentials,
    error::RealtimeError,
    protocol::{event_payload, EnginePacket, SocketPacket, DEFAULT_NAMESPACE},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Graceful close budget before the session task gives up on the peer
const CLOSE_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// DISCONNECT REASONS
// =============================================================================

/// Why a session ended after its handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Server sent a Socket.IO DISCONNECT
    ServerDisconnect,
    /// We closed the session ourselves
    ClientDisconnect,
    /// Socket closed (Engine.IO CLOSE, WebSocket close frame, stream end)
    TransportClose,
    /// Socket read/write failed
    TransportError,
    /// No Engine.IO ping within pingInterval + pingTimeout
    PingTimeout,
    /// Undecodable packet from the server
    ParseError,
    Other(String),
}

impl DisconnectReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ServerDisconnect => "io server disconnect",
            Self::ClientDisconnect => "io client disconnect",
            Self::TransportClose => "transport close",
            Self::TransportError => "transport error",
            Self::PingTimeout => "ping timeout",
            Self::ParseError => "parse error",
            Self::Other(reason) => reason,
        }
    }

    pub fn parse(reason: &str) -> Self {
        match reason {
            "io server disconnect" => Self::ServerDisconnect,
            "io client disconnect" => Self::ClientDisconnect,
            "transport close" => Self::TransportClose,
            "transport error" => Self::TransportError,
            "ping timeout" => Self::PingTimeout,
            "parse error" => Self::ParseError,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether to schedule a reconnect; `retry_unknown` decides `Other`.
    pub fn should_reconnect(&self, retry_unknown: bool) -> bool {
        match self {
            Self::ClientDisconnect => false,
            Self::Other(_) => retry_unknown,
            _ => true,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DisconnectReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// =============================================================================
// SESSION SIGNALS
// =============================================================================

/// Session -> manager notifications
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    Connected { socket_id: Option<String> },
    Event { name: String, payload: Value },
    HandshakeFailed(RealtimeError),
    Closed(DisconnectReason),
}

/// Signal tagged with the session generation that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMessage {
    pub generation: u64,
    pub signal: SessionSignal,
}

#[derive(Debug, Default)]
struct SessionShared {
    open: AtomicBool,
    terminated: AtomicBool,
    detached: AtomicBool,
    socket_id: RwLock<Option<String>>,
}

/// Upward channel handed to a transport for one session
#[derive(Debug, Clone)]
pub struct SessionSink {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionMessage>,
    shared: Arc<SessionShared>,
}

impl SessionSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SessionMessage>) -> Self {
        Self {
            generation,
            tx,
            shared: Arc::new(SessionShared::default()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connected(&self, socket_id: Option<String>) -> bool {
        if self.is_silenced() {
            return false;
        }
        *self.shared.socket_id.write() = socket_id.clone();
        self.shared.open.store(true, Ordering::SeqCst);
        self.deliver(SessionSignal::Connected { socket_id })
    }

    pub fn event(&self, name: impl Into<String>, payload: Value) -> bool {
        if self.is_silenced() {
            return false;
        }
        self.deliver(SessionSignal::Event {
            name: name.into(),
            payload,
        })
    }

    pub fn handshake_failed(&self, error: RealtimeError) -> bool {
        self.terminate(SessionSignal::HandshakeFailed(error))
    }

    pub fn closed(&self, reason: DisconnectReason) -> bool {
        self.terminate(SessionSignal::Closed(reason))
    }

    /// Whether the session is past its handshake and not yet closed
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn terminate(&self, signal: SessionSignal) -> bool {
        self.shared.open.store(false, Ordering::SeqCst);
        if self.shared.detached.load(Ordering::SeqCst) {
            return false;
        }
        // First terminal signal wins
        if self.shared.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.deliver(signal)
    }

    fn is_silenced(&self) -> bool {
        self.shared.detached.load(Ordering::SeqCst) || self.shared.terminated.load(Ordering::SeqCst)
    }

    fn deliver(&self, signal: SessionSignal) -> bool {
        self.tx
            .send(SessionMessage {
                generation: self.generation,
                signal,
            })
            .is_ok()
    }
}

// =============================================================================
// SESSION HANDLE
// =============================================================================

/// Outbound event queued for the session task
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub name: String,
    pub payload: Value,
}

/// Owner-side handle of one session
#[derive(Debug)]
pub struct SessionHandle {
    generation: u64,
    shared: Arc<SessionShared>,
    outbound: Option<mpsc::UnboundedSender<OutboundEvent>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Handle sharing state with `sink`. Transports attach their task and
    /// channels with the `with_*` builders.
    pub fn new(sink: &SessionSink) -> Self {
        Self {
            generation: sink.generation,
            shared: sink.shared.clone(),
            outbound: None,
            shutdown: None,
            task: None,
        }
    }

    pub fn with_outbound(mut self, outbound: mpsc::UnboundedSender<OutboundEvent>) -> Self {
        self.outbound = Some(outbound);
        self
    }

    pub fn with_task(mut self, task: JoinHandle<()>, shutdown: oneshot::Sender<()>) -> Self {
        self.task = Some(task);
        self.shutdown = Some(shutdown);
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Server-assigned socket id, once connected
    pub fn socket_id(&self) -> Option<String> {
        self.shared.socket_id.read().clone()
    }

    pub fn send(&self, name: impl Into<String>, payload: Value) -> Result<(), RealtimeError> {
        if !self.is_open() {
            return Err(RealtimeError::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(RealtimeError::NotConnected)?;
        outbound
            .send(OutboundEvent {
                name: name.into(),
                payload,
            })
            .map_err(|_| RealtimeError::transport("session task stopped"))
    }

    /// Detach the sink and ask the session task to shut down.
    ///
    /// Nothing the session does afterwards reaches the manager.
    pub fn close(mut self) {
        self.shared.detached.store(true, Ordering::SeqCst);
        self.shared.open.store(false, Ordering::SeqCst);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        // The task finishes its graceful close on its own, bounded by CLOSE_GRACE.
        self.task.take();
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shared.detached.store(true, Ordering::SeqCst);
        self.shared.open.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// Everything a transport needs to open one session
#[derive(Debug, Clone)]
pub struct Handshake {
    pub endpoint: String,
    pub credentials: Credentials,
    pub socket_path: String,
    pub timeout: Duration,
}

/// Opens sessions. `open` must return immediately; the outcome is reported
/// through the sink.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, handshake: Handshake, sink: SessionSink) -> SessionHandle;
}

/// Socket.IO v5 over WebSocket
#[derive(Debug, Clone)]
pub struct SocketIoTransport {
    ws_config: WebSocketConfig,
}

impl SocketIoTransport {
    pub fn new() -> Self {
        Self {
            ws_config: WebSocketConfig {
                max_message_size: Some(16 * 1024 * 1024),
                max_frame_size: Some(4 * 1024 * 1024),
                accept_unmasked_frames: false,
                ..Default::default()
            },
        }
    }
}

impl Default for SocketIoTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SocketIoTransport {
    fn open(&self, handshake: Handshake, sink: SessionSink) -> SessionHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = SessionHandle::new(&sink).with_outbound(outbound_tx);
        let task = tokio::spawn(run_session(
            handshake,
            self.ws_config.clone(),
            sink,
            outbound_rx,
            shutdown_rx,
        ));

        handle.with_task(task, shutdown_tx)
    }
}

/// `http(s)://host/prefix` -> `ws(s)://host/prefix/socket.io/?EIO=4&transport=websocket`
///
/// A path on the endpoint is a mount prefix for `socket_path`, not a Socket.IO
/// namespace; sessions always join the default namespace. Endpoints carrying a
/// query string or fragment are rejected.
pub fn socket_url(endpoint: &str, socket_path: &str) -> Result<String, RealtimeError> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains(['?', '#']) {
        return Err(RealtimeError::handshake(format!(
            "endpoint must not carry a query or fragment: {endpoint}"
        )));
    }
    let ws_base = if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if endpoint.starts_with("wss://") || endpoint.starts_with("ws://") {
        endpoint.to_string()
    } else {
        return Err(RealtimeError::handshake(format!(
            "unsupported endpoint scheme: {endpoint}"
        )));
    };

    let path = socket_path.trim_matches('/');
    Ok(format!("{ws_base}/{path}/?EIO=4&transport=websocket"))
}

async fn run_session(
    handshake: Handshake,
    ws_config: WebSocketConfig,
    sink: SessionSink,
    outbound_rx: mpsc::UnboundedReceiver<OutboundEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let established = tokio::select! {
        _ = &mut shutdown_rx => return,
        res = timeout(handshake.timeout, perform_handshake(&handshake, ws_config)) => res,
    };

    let (ws, socket_id, ping_window) = match established {
        Ok(Ok(established)) => established,
        Ok(Err(e)) => {
            warn!(error = %e, "socket.io handshake failed");
            sink.handshake_failed(e);
            return;
        }
        Err(_) => {
            warn!(timeout_ms = handshake.timeout.as_millis() as u64, "socket.io handshake timed out");
            sink.handshake_failed(RealtimeError::handshake_timeout(handshake.timeout));
            return;
        }
    };

    info!(socket_id = socket_id.as_deref().unwrap_or("-"), "✅ socket.io session open");
    sink.connected(socket_id);

    if let Some(reason) = pump(ws, &sink, outbound_rx, shutdown_rx, ping_window).await {
        info!(reason = %reason, "socket.io session closed");
        sink.closed(reason);
    }
}

/// WebSocket upgrade, Engine.IO OPEN, Socket.IO CONNECT ack
async fn perform_handshake(
    handshake: &Handshake,
    ws_config: WebSocketConfig,
) -> Result<(WsStream, Option<String>, Duration), RealtimeError> {
    let url = socket_url(&handshake.endpoint, &handshake.socket_path)?;
    info!(url = %url, sid = %handshake.credentials.redacted(), "🔌 Connecting to realtime endpoint");

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| RealtimeError::handshake(format!("bad websocket request: {e}")))?;
    match HeaderValue::from_str(&handshake.credentials.cookie_header) {
        Ok(cookie) => {
            request.headers_mut().insert("Cookie", cookie);
        }
        Err(_) => warn!("cookie string is not a valid header value, sending auth payload only"),
    }

    let (mut ws, response) = connect_async_with_config(request, Some(ws_config), true)
        .await
        .map_err(|e| RealtimeError::handshake(format!("websocket connect failed: {e}")))?;
    debug!(status = %response.status(), "websocket upgraded");

    let open = loop {
        match EnginePacket::decode(&next_text(&mut ws).await?)? {
            EnginePacket::Open(open) => break open,
            EnginePacket::Noop => continue,
            other => {
                return Err(RealtimeError::protocol(format!(
                    "expected engine.io open, got {other:?}"
                )))
            }
        }
    };
    let ping_window = Duration::from_millis(open.ping_interval + open.ping_timeout);

    let connect = SocketPacket::Connect {
        namespace: DEFAULT_NAMESPACE.to_string(),
        data: Some(json!({ "sid": handshake.credentials.session_id })),
    };
    ws.send(Message::Text(connect.to_frame()))
        .await
        .map_err(|e| RealtimeError::handshake(format!("failed to send connect: {e}")))?;

    loop {
        match EnginePacket::decode(&next_text(&mut ws).await?)? {
            EnginePacket::Ping(data) => {
                ws.send(Message::Text(EnginePacket::Pong(data).encode()))
                    .await
                    .map_err(|e| RealtimeError::handshake(format!("failed to send pong: {e}")))?;
            }
            EnginePacket::Message(payload) => match SocketPacket::decode(&payload)? {
                SocketPacket::Connect { data, .. } => {
                    let socket_id = data
                        .as_ref()
                        .and_then(|d| d.get("sid"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    return Ok((ws, socket_id, ping_window));
                }
                SocketPacket::ConnectError { message, .. } => {
                    return Err(RealtimeError::handshake(message));
                }
                other => debug!(packet = ?other, "ignoring packet before namespace connect"),
            },
            EnginePacket::Close => {
                return Err(RealtimeError::handshake("server closed during handshake"));
            }
            _ => {}
        }
    }
}

/// Next text frame during the handshake, answering WebSocket pings
async fn next_text(ws: &mut WsStream) -> Result<String, RealtimeError> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(Message::Close(frame))) => {
                return Err(RealtimeError::handshake(format!(
                    "server closed during handshake: {frame:?}"
                )));
            }
            Some(Ok(Message::Binary(data))) => {
                return Err(RealtimeError::protocol(format!(
                    "unexpected binary frame ({} bytes)",
                    data.len()
                )));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(RealtimeError::handshake(format!("websocket error: {e}"))),
            None => return Err(RealtimeError::handshake("stream ended during handshake")),
        }
    }
}

/// Steady-state loop. Returns `None` when the owner shut the session down.
async fn pump(
    ws: WsStream,
    sink: &SessionSink,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
    ping_window: Duration,
) -> Option<DisconnectReason> {
    let (mut write, mut read) = ws.split();
    let ping_deadline = sleep(ping_window);
    tokio::pin!(ping_deadline);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                let disconnect = SocketPacket::Disconnect { namespace: DEFAULT_NAMESPACE.to_string() };
                let _ = timeout(CLOSE_GRACE, async {
                    let _ = write.send(Message::Text(disconnect.to_frame())).await;
                    let _ = write.send(Message::Close(None)).await;
                })
                .await;
                debug!("socket.io session shut down by owner");
                return None;
            }
            out = outbound_rx.recv() => {
                let Some(out) = out else {
                    return None;
                };
                let frame = SocketPacket::Event {
                    namespace: DEFAULT_NAMESPACE.to_string(),
                    id: None,
                    name: out.name,
                    args: vec![out.payload],
                }
                .to_frame();
                if let Err(e) = write.send(Message::Text(frame)).await {
                    warn!(error = %e, "failed to send outbound event");
                    return Some(DisconnectReason::TransportError);
                }
            }
            _ = &mut ping_deadline => {
                warn!(window_ms = ping_window.as_millis() as u64, "no engine.io ping received");
                return Some(DisconnectReason::PingTimeout);
            }
            msg = read.next() => {
                let Some(msg) = msg else {
                    return Some(DisconnectReason::TransportClose);
                };
                match msg {
                    Ok(Message::Text(text)) => {
                        let packet = match EnginePacket::decode(&text) {
                            Ok(packet) => packet,
                            Err(e) => {
                                warn!(error = %e, "undecodable engine.io frame");
                                return Some(DisconnectReason::ParseError);
                            }
                        };
                        match packet {
                            EnginePacket::Ping(data) => {
                                ping_deadline.as_mut().reset(Instant::now() + ping_window);
                                if let Err(e) = write.send(Message::Text(EnginePacket::Pong(data).encode())).await {
                                    warn!(error = %e, "failed to send pong");
                                    return Some(DisconnectReason::TransportError);
                                }
                            }
                            EnginePacket::Close => return Some(DisconnectReason::TransportClose),
                            EnginePacket::Message(payload) => {
                                if let Some(reason) = dispatch_packet(&payload, sink) {
                                    return Some(reason);
                                }
                            }
                            _ => {}
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "websocket close frame");
                        return Some(DisconnectReason::TransportClose);
                    }
                    Ok(Message::Binary(data)) => {
                        debug!(bytes = data.len(), "ignoring binary frame");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "websocket read error");
                        return Some(DisconnectReason::TransportError);
                    }
                }
            }
        }
    }
}

fn dispatch_packet(payload: &str, sink: &SessionSink) -> Option<DisconnectReason> {
    match SocketPacket::decode(payload) {
        Ok(SocketPacket::Event { name, args, .. }) => {
            if tracing::enabled!(tracing::Level::DEBUG) {
                debug!(event = %name, args = args.len(), "inbound event");
            }
            sink.event(name, event_payload(args));
            None
        }
        Ok(SocketPacket::Disconnect { .. }) => Some(DisconnectReason::ServerDisconnect),
        Ok(SocketPacket::ConnectError { message, .. }) => {
            warn!(message = %message, "connect error after handshake");
            Some(DisconnectReason::ServerDisconnect)
        }
        Ok(other) => {
            debug!(packet = ?other, "ignoring socket.io packet");
            None
        }
        Err(e) => {
            warn!(error = %e, "undecodable socket.io packet");
            Some(DisconnectReason::ParseError)
        }
    }
}
