//! Integration tests for the realtime connection manager
//!
//! The manager is driven through a scripted in-memory transport, with Tokio
//! time paused so backoff delays elapse instantly and deterministically.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use realtime_link::realtime::{
    events::{EVENT_CUSTOM, EVENT_STATE_CHANGED},
    transport::{Handshake, OutboundEvent, SessionHandle, SessionSink, Transport},
    ConnectionState, DisconnectReason, RealtimeConfig, RealtimeError, RealtimeEvent,
    RealtimeManager, WILDCARD,
};

const ENDPOINT: &str = "https://realtime.test";
const COOKIES: &str = "sid=abc123; other=xyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Handshake completes immediately
    Accept,
    /// Handshake fails immediately
    Reject,
    /// Test drives the sink by hand
    Manual,
}

struct MockSession {
    sink: SessionSink,
    handshake: Handshake,
    outbound: mpsc::UnboundedReceiver<OutboundEvent>,
}

struct MockTransport {
    mode: Mutex<Mode>,
    sessions: Mutex<Vec<MockSession>>,
}

impl MockTransport {
    fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            sessions: Mutex::new(Vec::new()),
        })
    }

    fn set_mode(&self, mode: Mode) {
        *self.mode.lock() = mode;
    }

    fn opened(&self) -> usize {
        self.sessions.lock().len()
    }

    fn sink(&self, index: usize) -> SessionSink {
        self.sessions.lock()[index].sink.clone()
    }

    fn last_sink(&self) -> SessionSink {
        self.sessions.lock().last().expect("no session opened").sink.clone()
    }
}

impl Transport for MockTransport {
    fn open(&self, handshake: Handshake, sink: SessionSink) -> SessionHandle {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(&sink).with_outbound(out_tx);

        let mut sessions = self.sessions.lock();
        match *self.mode.lock() {
            Mode::Accept => {
                sink.connected(Some(format!("socket-{}", sessions.len() + 1)));
            }
            Mode::Reject => {
                sink.handshake_failed(RealtimeError::handshake("xhr poll error"));
            }
            Mode::Manual => {}
        }
        sessions.push(MockSession {
            sink,
            handshake,
            outbound: out_rx,
        });

        handle
    }
}

fn config(max_attempts: u32) -> RealtimeConfig {
    RealtimeConfig {
        max_reconnect_attempts: max_attempts,
        ..RealtimeConfig::default()
    }
}

fn manager_with(
    transport: &Arc<MockTransport>,
    cookies: &str,
    config: RealtimeConfig,
) -> (RealtimeManager, mpsc::UnboundedReceiver<RealtimeEvent>) {
    let manager = RealtimeManager::with_transport(ENDPOINT, cookies, config, transport.clone());
    let (_, events) = manager.subscribe_channel(WILDCARD);
    (manager, events)
}

/// Let the driver and dispatcher tasks catch up without advancing time
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<RealtimeEvent>) -> Vec<RealtimeEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn transitions(events: &[RealtimeEvent]) -> Vec<(ConnectionState, ConnectionState)> {
    events
        .iter()
        .filter_map(|e| match e {
            RealtimeEvent::StateChanged(change) => Some((change.previous_state, change.state)),
            _ => None,
        })
        .collect()
}

fn reconnect_delays(events: &[RealtimeEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            RealtimeEvent::StateChanged(change) if change.state == ConnectionState::Reconnecting => {
                change.details.delay_ms
            }
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_connect_success() {
    use ConnectionState::*;

    let transport = MockTransport::new(Mode::Accept);
    let (manager, mut events) = manager_with(&transport, COOKIES, config(10));

    manager.connect();
    settle().await;

    let events = drain(&mut events);
    assert_eq!(transitions(&events), vec![(Disconnected, Connecting), (Connecting, Connected)]);
    assert!(events.iter().any(|e| matches!(
        e,
        RealtimeEvent::Connected(c) if c.session_id.as_deref() == Some("socket-1") && c.endpoint == ENDPOINT
    )));

    let status = manager.status();
    assert_eq!(status.state, Connected);
    assert!(status.connected);
    assert!(manager.is_connected());
    assert_eq!(status.session_id.as_deref(), Some("socket-1"));
    assert_eq!(status.reconnect_attempts, 0);
    assert!(status.last_connection_time.is_some());
    assert_eq!(status.endpoint, ENDPOINT);

    let info = manager.connection_info();
    assert_eq!(info.message, format!("Connected to {ENDPOINT}"));
    assert!(!info.can_retry);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_carries_credentials() {
    let transport = MockTransport::new(Mode::Manual);
    let (manager, _events) = manager_with(&transport, COOKIES, config(10));

    manager.connect();

    let sessions = transport.sessions.lock();
    let handshake = &sessions[0].handshake;
    assert_eq!(handshake.endpoint, ENDPOINT);
    assert_eq!(handshake.credentials.session_id, "abc123");
    assert_eq!(handshake.credentials.cookie_header, COOKIES);
    assert_eq!(handshake.socket_path, "/socket.io");
    assert_eq!(handshake.timeout, Duration::from_secs(20));
}

#[tokio::test(start_paused = true)]
async fn test_connect_is_idempotent() {
    let transport = MockTransport::new(Mode::Manual);
    let (manager, _events) = manager_with(&transport, COOKIES, config(10));

    manager.connect();
    manager.connect();
    settle().await;
    assert_eq!(transport.opened(), 1);
    assert_eq!(manager.status().state, ConnectionState::Connecting);
    assert!(!manager.is_connected());

    transport.sink(0).connected(Some("socket-1".into()));
    settle().await;
    manager.connect();
    settle().await;

    let status = manager.status();
    assert_eq!(transport.opened(), 1);
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(status.total_reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_session_id_is_terminal() {
    let transport = MockTransport::new(Mode::Accept);
    let (manager, mut events) = manager_with(&transport, "other=xyz", config(10));

    manager.connect();
    settle().await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    let events = drain(&mut events);
    assert_eq!(
        transitions(&events),
        vec![
            (ConnectionState::Disconnected, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Error),
        ]
    );
    assert!(events.iter().any(|e| matches!(
        e,
        RealtimeEvent::Error(err) if matches!(err.error, RealtimeError::MissingCredentials { .. }) && !err.give_up
    )));

    assert_eq!(transport.opened(), 0);
    let info = manager.connection_info();
    assert_eq!(info.state, ConnectionState::Error);
    assert!(info.can_retry);
    assert!(info.message.starts_with("Connection failed: No session ID found"));
    assert_eq!(info.details.total_reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let transport = MockTransport::new(Mode::Reject);
    let (manager, mut events) = manager_with(&transport, COOKIES, config(3));

    manager.connect();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let events = drain(&mut events);
    // initial attempt + 3 scheduled reconnects
    assert_eq!(transport.opened(), 4);
    assert_eq!(reconnect_delays(&events), vec![1_000, 2_000, 4_000]);

    let give_up: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RealtimeEvent::Error(err) if err.give_up => Some(err.message.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(give_up, vec!["Failed to connect after 3 attempts".to_string()]);

    let info = manager.connection_info();
    assert_eq!(info.state, ConnectionState::Error);
    assert!(info.can_retry);
    assert_eq!(info.details.reconnect_attempts, 3);
    assert_eq!(info.details.total_reconnect_attempts, 3);

    // Nothing fires until retry()
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.opened(), 4);
    assert_eq!(manager.status().state, ConnectionState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_retry_resets_attempts() {
    let transport = MockTransport::new(Mode::Reject);
    let (manager, _events) = manager_with(&transport, COOKIES, config(2));

    manager.connect();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(manager.status().reconnect_attempts, 2);
    assert_eq!(manager.status().state, ConnectionState::Error);

    transport.set_mode(Mode::Accept);
    manager.retry();
    assert_eq!(manager.status().reconnect_attempts, 0);
    assert!(manager.status().last_error.is_none());
    settle().await;

    let status = manager.status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(status.total_reconnect_attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_from_reconnecting_cancels_timer() {
    let transport = MockTransport::new(Mode::Reject);
    let (manager, _events) = manager_with(&transport, COOKIES, config(5));

    manager.connect();
    settle().await;
    assert_eq!(manager.status().state, ConnectionState::Reconnecting);
    assert_eq!(manager.status().reconnect_attempts, 1);

    transport.set_mode(Mode::Manual);
    manager.retry();
    assert_eq!(manager.status().reconnect_attempts, 0);
    assert_eq!(transport.opened(), 2);

    // The old 1s timer must not open a third session
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.opened(), 2);
    assert_eq!(manager.status().state, ConnectionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_retry_while_connected_replaces_session() {
    let transport = MockTransport::new(Mode::Accept);
    let (manager, mut events) = manager_with(&transport, COOKIES, config(10));

    manager.connect();
    settle().await;
    let old_sink = transport.sink(0);
    assert!(old_sink.is_open());

    manager.retry();
    settle().await;

    assert_eq!(transport.opened(), 2);
    assert!(!old_sink.is_open());
    assert!(!old_sink.event("ai_progress", json!("stale")));

    let status = manager.status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.session_id.as_deref(), Some("socket-2"));

    let events = drain(&mut events);
    assert!(transitions(&events).contains(&(ConnectionState::Connected, ConnectionState::Disconnected)));
    assert!(!events.iter().any(|e| matches!(e, RealtimeEvent::Domain(_))));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let transport = MockTransport::new(Mode::Reject);
    let (manager, mut events) = manager_with(&transport, COOKIES, config(10));

    manager.connect();
    settle().await;
    assert_eq!(manager.status().state, ConnectionState::Reconnecting);

    manager.disconnect();
    let status = manager.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.reconnect_attempts, 0);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.opened(), 1);
    assert_eq!(manager.status().state, ConnectionState::Disconnected);

    settle().await;
    let events = drain(&mut events);
    let last = events
        .iter()
        .rev()
        .find_map(|e| match e {
            RealtimeEvent::StateChanged(change) => Some(change.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(last.state, ConnectionState::Disconnected);
    assert!(last.details.manual);
    assert!(manager.connection_info().can_retry);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_from_every_state() {
    let transport = MockTransport::new(Mode::Manual);
    let (manager, _events) = manager_with(&transport, COOKIES, config(10));

    // disconnected
    manager.disconnect();
    assert_eq!(manager.status().state, ConnectionState::Disconnected);

    // connecting
    manager.connect();
    manager.disconnect();
    assert_eq!(manager.status().state, ConnectionState::Disconnected);

    // connected
    manager.connect();
    transport.last_sink().connected(Some("s".into()));
    settle().await;
    assert_eq!(manager.status().state, ConnectionState::Connected);
    let live = transport.last_sink();
    manager.disconnect();
    assert_eq!(manager.status().state, ConnectionState::Disconnected);
    assert!(!manager.is_connected());
    assert!(!live.is_open());

    // reconnecting (failed handshake arms the timer)
    manager.connect();
    transport.last_sink().handshake_failed(RealtimeError::handshake("refused"));
    settle().await;
    assert_eq!(manager.status().state, ConnectionState::Reconnecting);
    manager.disconnect();
    assert_eq!(manager.status().state, ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.opened(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_from_error_state() {
    // missing credentials
    let transport = MockTransport::new(Mode::Accept);
    let (manager, mut events) = manager_with(&transport, "other=xyz", config(10));
    manager.connect();
    assert_eq!(manager.status().state, ConnectionState::Error);

    manager.disconnect();
    settle().await;
    assert_eq!(manager.status().state, ConnectionState::Disconnected);
    assert!(transitions(&drain(&mut events)).contains(&(ConnectionState::Error, ConnectionState::Disconnected)));

    // after give-up
    let transport = MockTransport::new(Mode::Reject);
    let (manager, mut events) = manager_with(&transport, COOKIES, config(1));
    manager.connect();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(manager.status().state, ConnectionState::Error);
    assert_eq!(transport.opened(), 2);

    manager.disconnect();
    settle().await;
    let status = manager.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(
        transitions(&drain(&mut events)).last(),
        Some(&(ConnectionState::Error, ConnectionState::Disconnected))
    );

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.opened(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_close_reconnects() {
    use ConnectionState::*;

    let transport = MockTransport::new(Mode::Accept);
    let (manager, mut events) = manager_with(&transport, COOKIES, config(10));

    manager.connect();
    settle().await;
    drain(&mut events);

    transport.sink(0).closed(DisconnectReason::TransportClose);
    settle().await;

    let after_close = drain(&mut events);
    assert_eq!(transitions(&after_close), vec![(Connected, Disconnected), (Disconnected, Reconnecting)]);
    assert!(after_close.iter().any(|e| matches!(
        e,
        RealtimeEvent::Disconnected(d) if d.reason == DisconnectReason::TransportClose
    )));
    assert_eq!(manager.connection_info().message, "Reconnecting (1/10)...");

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    settle().await;

    let status = manager.status();
    assert_eq!(transport.opened(), 2);
    assert_eq!(status.state, Connected);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(status.total_reconnect_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_disconnect_reason_policy() {
    let transport = MockTransport::new(Mode::Accept);
    let strict = RealtimeConfig {
        retry_unknown_disconnects: false,
        ..config(10)
    };
    let (manager, _events) = manager_with(&transport, COOKIES, strict);

    manager.connect();
    settle().await;
    transport.sink(0).closed(DisconnectReason::Other("forced close".into()));
    settle().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(manager.status().state, ConnectionState::Disconnected);
    assert_eq!(transport.opened(), 1);

    // Default policy retries unknown reasons
    let transport = MockTransport::new(Mode::Accept);
    let (manager, _events) = manager_with(&transport, COOKIES, config(10));
    manager.connect();
    settle().await;
    transport.sink(0).closed(DisconnectReason::Other("forced close".into()));
    settle().await;
    assert_eq!(manager.status().state, ConnectionState::Reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_close_during_handshake_counts_as_failure() {
    let transport = MockTransport::new(Mode::Manual);
    let (manager, mut events) = manager_with(&transport, COOKIES, config(10));

    manager.connect();
    transport.sink(0).closed(DisconnectReason::TransportClose);
    settle().await;

    let events = drain(&mut events);
    assert!(transitions(&events).contains(&(ConnectionState::Connecting, ConnectionState::Error)));
    assert!(events.iter().any(|e| matches!(
        e,
        RealtimeEvent::Error(err) if err.attempt == Some(1) && !err.give_up
    )));
    assert_eq!(manager.status().state, ConnectionState::Reconnecting);
}

#[tokio::test(start_paused = true)]
async fn test_events_delivered_in_order() {
    let transport = MockTransport::new(Mode::Accept);
    let (manager, mut events) = manager_with(&transport, COOKIES, config(10));

    manager.connect();
    settle().await;
    drain(&mut events);

    let sink = transport.sink(0);
    sink.event("ai_progress", json!({"step": "A"}));
    sink.event("msgprint", json!("B"));
    sink.event("connect_error", json!("bookkeeping"));
    sink.event("build_finished", json!(["C", 3]));
    settle().await;

    let events = drain(&mut events);
    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], RealtimeEvent::Domain(d) if d.name == "ai_progress" && d.payload == json!({"step": "A"})));
    assert!(matches!(&events[1], RealtimeEvent::Domain(d) if d.name == "msgprint" && d.payload == json!("B")));
    assert!(matches!(
        &events[2],
        RealtimeEvent::Custom(c) if c.event_name == "build_finished" && c.payload == json!(["C", 3])
    ));
    assert_eq!(events[2].name(), EVENT_CUSTOM);
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_survive_reconnect() {
    let transport = MockTransport::new(Mode::Accept);
    let (manager, _events) = manager_with(&transport, COOKIES, config(10));

    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let seen_by_handler = seen.clone();
    manager.subscribe("ai_progress", move |event: &RealtimeEvent| {
        if let RealtimeEvent::Domain(d) = event {
            seen_by_handler.lock().push(d.payload.clone());
        }
    });

    manager.connect();
    settle().await;
    transport.sink(0).event("ai_progress", json!(1));
    transport.sink(0).closed(DisconnectReason::ServerDisconnect);
    settle().await;

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    settle().await;
    assert_eq!(transport.opened(), 2);

    // Old session is gone; only the new one reaches subscribers
    assert!(!transport.sink(0).event("ai_progress", json!("stale")));
    transport.sink(1).event("ai_progress", json!(2));
    settle().await;

    assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_unknown_handler_is_noop() {
    let transport = MockTransport::new(Mode::Accept);
    let (manager, _events) = manager_with(&transport, COOKIES, config(10));

    let hits = Arc::new(Mutex::new(0u32));
    let counter = hits.clone();
    let id = manager.subscribe("msgprint", move |_: &RealtimeEvent| *counter.lock() += 1);

    let (other_id, _rx) = manager.subscribe_channel("ai_progress");
    assert!(!manager.unsubscribe("msgprint", other_id));
    assert!(!manager.unsubscribe("never_subscribed", id));

    manager.connect();
    settle().await;
    transport.sink(0).event("msgprint", Value::Null);
    settle().await;
    assert_eq!(*hits.lock(), 1);

    assert!(manager.unsubscribe("msgprint", id));
    transport.sink(0).event("msgprint", Value::Null);
    settle().await;
    assert_eq!(*hits.lock(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handler_can_retry_reentrantly() {
    let transport = MockTransport::new(Mode::Reject);
    let (manager, mut events) = manager_with(&transport, COOKIES, config(1));

    let weak = manager.downgrade();
    let transport_for_handler = transport.clone();
    manager.subscribe("error", move |event: &RealtimeEvent| {
        let RealtimeEvent::Error(err) = event else {
            return;
        };
        if err.give_up {
            transport_for_handler.set_mode(Mode::Accept);
            if let Some(manager) = weak.upgrade() {
                manager.retry();
            }
        }
    });

    manager.connect();
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;

    assert_eq!(transport.opened(), 3);
    assert_eq!(manager.status().state, ConnectionState::Connected);

    // Notifications stay in transition order across the re-entrant retry
    let order = transitions(&drain(&mut events));
    let expected_tail = vec![
        (ConnectionState::Error, ConnectionState::Error),
        (ConnectionState::Error, ConnectionState::Connecting),
        (ConnectionState::Connecting, ConnectionState::Connected),
    ];
    assert_eq!(order[order.len() - 3..].to_vec(), expected_tail);
}

#[tokio::test(start_paused = true)]
async fn test_emit_requires_connection() {
    let transport = MockTransport::new(Mode::Accept);
    let (manager, _events) = manager_with(&transport, COOKIES, config(10));

    assert_eq!(manager.emit("chat", json!("hi")), Err(RealtimeError::NotConnected));

    manager.connect();
    settle().await;
    manager.emit("chat", json!({"text": "hi"})).unwrap();

    let outbound = transport.sessions.lock()[0].outbound.try_recv().unwrap();
    assert_eq!(outbound.name, "chat");
    assert_eq!(outbound.payload, json!({"text": "hi"}));

    manager.disconnect();
    assert_eq!(manager.emit("chat", json!("late")), Err(RealtimeError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_state_change_payload() {
    let transport = MockTransport::new(Mode::Reject);
    let (manager, _events) = manager_with(&transport, COOKIES, config(10));
    let (_, mut changes) = manager.subscribe_channel(EVENT_STATE_CHANGED);

    manager.connect();
    settle().await;

    let changes = drain(&mut changes);
    let reconnecting = changes
        .iter()
        .find_map(|e| match e {
            RealtimeEvent::StateChanged(c) if c.state == ConnectionState::Reconnecting => Some(c.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(reconnecting.previous_state, ConnectionState::Error);
    assert_eq!(reconnecting.reconnect_attempts, 1);
    assert_eq!(reconnecting.max_attempts, 10);
    assert_eq!(reconnecting.details.attempt, Some(1));
    assert_eq!(reconnecting.details.delay_ms, Some(1_000));

    let json = serde_json::to_value(&changes[0]).unwrap();
    assert_eq!(json["event"], "connection_state_changed");
    assert_eq!(json["data"]["state"], "connecting");
}
