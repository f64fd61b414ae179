//! Realtime connection manager
//!
//! Public façade over the transport session, state machine, reconnection
//! scheduler and event multiplexer.
//!
//! Threading model:
//! - All mutable state sits behind one `parking_lot::Mutex` (short, never
//!   held across an await).
//! - Events are queued on an ordered channel while that lock is held and
//!   delivered by a dispatcher task, so handlers never run under the lock and
//!   may call back into the manager (e.g. `retry()` from an `error` handler).
//! - Session signals arrive on a driver task and are matched against the
//!   current session generation; signals from disposed sessions are dropped.
//!
//! Usage:
//! ```ignore
//! let manager = RealtimeManager::new("https://example.com", "sid=abc123", RealtimeConfig::from_env());
//! manager.subscribe("ai_progress", |event| println!("{}", event.name()));
//! manager.connect();
//! ```

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{
    config::RealtimeConfig,
    credentials::{redact, Credentials},
    error::RealtimeError,
    events::{
        ConnectedEvent, DisconnectedEvent, ErrorEvent, EventMultiplexer,
        RealtimeEvent, SubscriptionId, SubscriptionRegistry,
    },
    scheduler::{ReconnectScheduler, ScheduleOutcome},
    state::{ConnectionState, ConnectionStateMachine, TransitionDetails},
    transport::{
        DisconnectReason, Handshake, SessionHandle, SessionMessage, SessionSignal, SessionSink,
        SocketIoTransport, Transport,
    },
};

/// Read-only status snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub session_id: Option<String>,
    pub reconnect_attempts: u32,
    pub max_attempts: u32,
    pub total_reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub last_connection_time: Option<DateTime<Utc>>,
    pub endpoint: String,
}

/// Status projection for UI display
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub message: String,
    pub can_retry: bool,
    pub details: ConnectionStatus,
}

struct Core {
    machine: ConnectionStateMachine,
    scheduler: ReconnectScheduler,
    session: Option<SessionHandle>,
    next_session_generation: u64,
    session_id: Option<String>,
    last_error: Option<String>,
    last_connection_time: Option<DateTime<Utc>>,
}

struct Inner {
    endpoint: String,
    cookies: String,
    config: RealtimeConfig,
    transport: Arc<dyn Transport>,
    multiplexer: EventMultiplexer,
    registry: Arc<SubscriptionRegistry>,
    core: Mutex<Core>,
    signal_tx: mpsc::UnboundedSender<SessionMessage>,
    events_tx: mpsc::UnboundedSender<RealtimeEvent>,
}

/// Cloneable handle to one managed realtime connection
#[derive(Clone)]
pub struct RealtimeManager {
    inner: Arc<Inner>,
}

/// Non-owning handle, for handlers that call back into the manager
#[derive(Clone)]
pub struct WeakRealtimeManager {
    inner: Weak<Inner>,
}

impl WeakRealtimeManager {
    pub fn upgrade(&self) -> Option<RealtimeManager> {
        self.inner.upgrade().map(|inner| RealtimeManager { inner })
    }
}

impl RealtimeManager {
    /// Manager using the Socket.IO WebSocket transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(endpoint: impl Into<String>, cookies: impl Into<String>, config: RealtimeConfig) -> Self {
        Self::with_transport(endpoint, cookies, config, Arc::new(SocketIoTransport::new()))
    }

    /// Manager using a caller-supplied transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_transport(
        endpoint: impl Into<String>,
        cookies: impl Into<String>,
        config: RealtimeConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(SubscriptionRegistry::new());
        let scheduler = ReconnectScheduler::new(config.backoff(), config.max_reconnect_attempts);

        let inner = Arc::new(Inner {
            endpoint: endpoint.into(),
            cookies: cookies.into(),
            multiplexer: EventMultiplexer::new(config.known_events.iter().cloned()),
            config,
            transport,
            registry: registry.clone(),
            core: Mutex::new(Core {
                machine: ConnectionStateMachine::new(),
                scheduler,
                session: None,
                next_session_generation: 0,
                session_id: None,
                last_error: None,
                last_connection_time: None,
            }),
            signal_tx,
            events_tx,
        });

        tokio::spawn(drive_signals(Arc::downgrade(&inner), signal_rx));
        tokio::spawn(dispatch_events(registry, events_rx));

        info!(
            endpoint = %inner.endpoint,
            max_attempts = inner.config.max_reconnect_attempts,
            "realtime manager initialized"
        );

        Self { inner }
    }

    /// Start connecting. Returns immediately; the outcome arrives as events.
    ///
    /// No-op while connected or connecting.
    pub fn connect(&self) {
        let mut core = self.inner.core.lock();
        self.inner.connect_locked(&mut core);
    }

    /// Tear down the connection and stop reconnecting. Safe from any state.
    pub fn disconnect(&self) {
        let mut core = self.inner.core.lock();
        info!(state = %core.machine.state(), "disconnecting");

        core.scheduler.reset();
        self.inner.dispose_session(&mut core);
        self.inner.transition(
            &mut core,
            ConnectionState::Disconnected,
            TransitionDetails::manual(DisconnectReason::ClientDisconnect.as_str()),
        );
    }

    /// Caller-initiated recovery: reset attempts and last error, drop any
    /// session, connect again.
    pub fn retry(&self) {
        let mut core = self.inner.core.lock();
        info!(state = %core.machine.state(), "manual retry triggered");

        core.scheduler.reset();
        core.last_error = None;
        self.inner.dispose_session(&mut core);

        if matches!(
            core.machine.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            self.inner.transition(
                &mut core,
                ConnectionState::Disconnected,
                TransitionDetails::manual("retry"),
            );
        }

        self.inner.connect_locked(&mut core);
    }

    pub fn is_connected(&self) -> bool {
        let core = self.inner.core.lock();
        Inner::is_connected_locked(&core)
    }

    pub fn status(&self) -> ConnectionStatus {
        let core = self.inner.core.lock();
        ConnectionStatus {
            state: core.machine.state(),
            connected: Inner::is_connected_locked(&core),
            session_id: core.session_id.clone(),
            reconnect_attempts: core.scheduler.attempt(),
            max_attempts: core.scheduler.max_attempts(),
            total_reconnect_attempts: core.scheduler.total_attempts(),
            last_error: core.last_error.clone(),
            last_connection_time: core.last_connection_time,
            endpoint: self.inner.endpoint.clone(),
        }
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        let status = self.status();

        let message = match status.state {
            ConnectionState::Connected => format!("Connected to {}", status.endpoint),
            ConnectionState::Connecting => "Connecting...".to_string(),
            ConnectionState::Disconnected => "Disconnected".to_string(),
            ConnectionState::Reconnecting => format!(
                "Reconnecting ({}/{})...",
                status.reconnect_attempts, status.max_attempts
            ),
            ConnectionState::Error => format!(
                "Connection failed: {}",
                status.last_error.as_deref().unwrap_or("Unknown error")
            ),
        };

        ConnectionInfo {
            state: status.state,
            message,
            can_retry: status.state.can_retry(),
            details: status,
        }
    }

    /// Register a handler for `event_name` (or [`super::events::WILDCARD`]).
    /// Survives reconnects.
    pub fn subscribe<F>(&self, event_name: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        self.inner.registry.subscribe(event_name, Arc::new(handler))
    }

    /// Unknown ids are a no-op returning `false`
    pub fn unsubscribe(&self, event_name: &str, id: SubscriptionId) -> bool {
        self.inner.registry.unsubscribe(event_name, id)
    }

    /// Channel-based subscription for async consumers.
    ///
    /// Unsubscribe with the returned id once the receiver is no longer read.
    pub fn subscribe_channel(
        &self,
        event_name: impl Into<String>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<RealtimeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(event_name, move |event: &RealtimeEvent| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    /// Send an event to the server over the live session
    pub fn emit(&self, event_name: impl Into<String>, payload: Value) -> Result<(), RealtimeError> {
        let core = self.inner.core.lock();
        if core.machine.state() != ConnectionState::Connected {
            return Err(RealtimeError::NotConnected);
        }
        core.session
            .as_ref()
            .ok_or(RealtimeError::NotConnected)?
            .send(event_name, payload)
    }

    pub fn downgrade(&self) -> WeakRealtimeManager {
        WeakRealtimeManager {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl std::fmt::Debug for RealtimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeManager")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.inner.core.lock().machine.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn emit(&self, event: RealtimeEvent) {
        // Receiver only goes away when the runtime shuts down
        let _ = self.events_tx.send(event);
    }

    fn transition(&self, core: &mut Core, to: ConnectionState, details: TransitionDetails) -> bool {
        let attempts = core.scheduler.attempt();
        let max_attempts = core.scheduler.max_attempts();
        match core.machine.transition(to, details, attempts, max_attempts) {
            Ok(change) => {
                self.emit(RealtimeEvent::StateChanged(change));
                true
            }
            Err(e) => {
                error!(error = %e, "state transition refused");
                false
            }
        }
    }

    fn is_connected_locked(core: &Core) -> bool {
        core.machine.state() == ConnectionState::Connected
            && core.session.as_ref().is_some_and(SessionHandle::is_open)
    }

    fn connect_locked(self: &Arc<Self>, core: &mut Core) {
        match core.machine.state() {
            ConnectionState::Connected => {
                debug!("already connected");
                return;
            }
            ConnectionState::Connecting => {
                debug!("connection already in progress");
                return;
            }
            _ => {}
        }

        // A host connect() during backoff supersedes the pending timer
        core.scheduler.cancel();

        if !self.transition(core, ConnectionState::Connecting, TransitionDetails::default()) {
            return;
        }

        let Some(credentials) =
            Credentials::from_cookie_string(&self.cookies, &self.config.session_cookie)
        else {
            let error = RealtimeError::MissingCredentials {
                key: self.config.session_cookie.clone(),
            };
            error!(error = %error, "cannot connect without credentials");
            core.last_error = Some(error.to_string());
            self.transition(core, ConnectionState::Error, TransitionDetails::error(error.to_string()));
            self.emit(RealtimeEvent::Error(ErrorEvent::new(error, None)));
            return;
        };

        self.dispose_session(core);

        core.next_session_generation += 1;
        let generation = core.next_session_generation;
        let sink = SessionSink::new(generation, self.signal_tx.clone());
        let handshake = Handshake {
            endpoint: self.endpoint.clone(),
            credentials,
            socket_path: self.config.socket_path.clone(),
            timeout: self.config.handshake_timeout(),
        };

        info!(
            endpoint = %self.endpoint,
            sid = %handshake.credentials.redacted(),
            generation,
            "🔌 opening realtime session"
        );
        core.session = Some(self.transport.open(handshake, sink));
    }

    fn dispose_session(&self, core: &mut Core) {
        if let Some(session) = core.session.take() {
            debug!(generation = session.generation(), "disposing session");
            session.close();
        }
        core.session_id = None;
    }

    fn schedule_reconnect(self: &Arc<Self>, core: &mut Core) {
        let weak = Arc::downgrade(self);
        let outcome = core.scheduler.schedule(move |generation| {
            if let Some(inner) = weak.upgrade() {
                inner.on_timer_fired(generation);
            }
        });

        match outcome {
            ScheduleOutcome::Armed { attempt, delay } => {
                let details = TransitionDetails {
                    attempt: Some(attempt),
                    delay_ms: Some(delay.as_millis() as u64),
                    ..Default::default()
                };
                if !self.transition(core, ConnectionState::Reconnecting, details) {
                    core.scheduler.cancel();
                }
            }
            ScheduleOutcome::GiveUp { attempts } => {
                let error = RealtimeError::ExhaustedRetries { attempts };
                error!(error = %error, "giving up on reconnection");
                core.last_error = Some(error.to_string());
                let details = TransitionDetails {
                    error: Some(error.to_string()),
                    give_up: true,
                    ..Default::default()
                };
                self.transition(core, ConnectionState::Error, details);
                self.emit(RealtimeEvent::Error(ErrorEvent::new(error, None)));
            }
        }
    }

    fn on_timer_fired(self: &Arc<Self>, generation: u64) {
        let mut core = self.core.lock();
        if !core.scheduler.take_fired(generation) {
            return;
        }
        info!(attempt = core.scheduler.attempt(), "attempting reconnect");
        self.connect_locked(&mut core);
    }

    fn handle_session_message(self: &Arc<Self>, message: SessionMessage) {
        let mut core = self.core.lock();

        let current = core.session.as_ref().map(SessionHandle::generation);
        if current != Some(message.generation) {
            debug!(
                generation = message.generation,
                current = ?current,
                "dropping signal from stale session"
            );
            return;
        }

        match message.signal {
            SessionSignal::Connected { socket_id } => self.on_connected(&mut core, socket_id),
            SessionSignal::Event { name, payload } => {
                if let Some(event) = self.multiplexer.route(name, payload) {
                    self.emit(event);
                }
            }
            SessionSignal::HandshakeFailed(error) => {
                self.dispose_session(&mut core);
                self.fail_attempt(&mut core, error);
            }
            SessionSignal::Closed(reason) => self.on_closed(&mut core, reason),
        }
    }

    fn on_connected(&self, core: &mut Core, socket_id: Option<String>) {
        if core.machine.state() != ConnectionState::Connecting {
            warn!(state = %core.machine.state(), "handshake completed outside connecting state");
            return;
        }

        core.scheduler.reset();
        core.last_error = None;
        core.last_connection_time = Some(Utc::now());
        core.session_id = socket_id.clone();

        info!(
            socket_id = socket_id.as_deref().map(redact).unwrap_or_default(),
            endpoint = %self.endpoint,
            "✅ connected"
        );

        let details = TransitionDetails {
            session_id: socket_id.clone(),
            ..Default::default()
        };
        self.transition(core, ConnectionState::Connected, details);
        self.emit(RealtimeEvent::Connected(ConnectedEvent {
            session_id: socket_id,
            endpoint: self.endpoint.clone(),
        }));
    }

    fn on_closed(self: &Arc<Self>, core: &mut Core, reason: DisconnectReason) {
        self.dispose_session(core);

        if core.machine.state() == ConnectionState::Connecting {
            let error = RealtimeError::handshake(format!("connection closed during handshake: {reason}"));
            self.fail_attempt(core, error);
            return;
        }

        warn!(reason = %reason, "❌ disconnected");
        self.transition(core, ConnectionState::Disconnected, TransitionDetails::reason(reason.as_str()));
        self.emit(RealtimeEvent::Disconnected(DisconnectedEvent {
            reason: reason.clone(),
        }));

        if reason.should_reconnect(self.config.retry_unknown_disconnects) {
            self.schedule_reconnect(core);
        } else {
            info!(reason = %reason, "not reconnecting");
        }
    }

    /// Handshake-class failure: error state, `error` event, then backoff
    fn fail_attempt(self: &Arc<Self>, core: &mut Core, error: RealtimeError) {
        let attempt = core.scheduler.attempt() + 1;
        warn!(error = %error, attempt, "connection attempt failed");

        core.last_error = Some(error.to_string());
        let details = TransitionDetails {
            error: Some(error.to_string()),
            attempt: Some(attempt),
            ..Default::default()
        };
        self.transition(core, ConnectionState::Error, details);

        let retryable = error.is_retryable();
        self.emit(RealtimeEvent::Error(ErrorEvent::new(error, Some(attempt))));

        if retryable {
            self.schedule_reconnect(core);
        }
    }
}

async fn drive_signals(inner: Weak<Inner>, mut signal_rx: mpsc::UnboundedReceiver<SessionMessage>) {
    while let Some(message) = signal_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_session_message(message);
    }
    debug!("session signal driver stopped");
}

async fn dispatch_events(
    registry: Arc<SubscriptionRegistry>,
    mut events_rx: mpsc::UnboundedReceiver<RealtimeEvent>,
) {
    while let Some(event) = events_rx.recv().await {
        registry.dispatch(&event);
    }
    debug!("event dispatcher stopped");
}
