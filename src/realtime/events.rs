//! Outbound event model, inbound event routing and the subscription registry.

use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use serde::{ser::SerializeStruct, Serialize, Serializer};
use serde_json::Value;
use tracing::{debug, error};

use super::{error::RealtimeError, state::StateChange, transport::DisconnectReason};

/// Subscribe to every event
pub const WILDCARD: &str = "*";

pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_DISCONNECTED: &str = "disconnected";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_STATE_CHANGED: &str = "connection_state_changed";
pub const EVENT_CUSTOM: &str = "custom_event";

/// Named event received from the server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainEvent {
    pub name: String,
    pub payload: Value,
}

/// Unrecognised event name, forwarded as `custom_event`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomEvent {
    pub event_name: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectedEvent {
    pub session_id: Option<String>,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisconnectedEvent {
    pub reason: DisconnectReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    pub give_up: bool,
    pub error: RealtimeError,
}

impl ErrorEvent {
    pub fn new(error: RealtimeError, attempt: Option<u32>) -> Self {
        Self {
            message: error.to_string(),
            attempt,
            give_up: matches!(error, RealtimeError::ExhaustedRetries { .. }),
            error,
        }
    }
}

/// Everything the manager publishes to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Connected(ConnectedEvent),
    Disconnected(DisconnectedEvent),
    Error(ErrorEvent),
    StateChanged(StateChange),
    Domain(DomainEvent),
    Custom(CustomEvent),
}

impl RealtimeEvent {
    /// Name subscribers register under
    pub fn name(&self) -> &str {
        match self {
            Self::Connected(_) => EVENT_CONNECTED,
            Self::Disconnected(_) => EVENT_DISCONNECTED,
            Self::Error(_) => EVENT_ERROR,
            Self::StateChanged(_) => EVENT_STATE_CHANGED,
            Self::Domain(e) => &e.name,
            Self::Custom(_) => EVENT_CUSTOM,
        }
    }
}

// Serialized as {"event": <name>, "data": <payload>} for hosts that forward to a UI.
impl Serialize for RealtimeEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("RealtimeEvent", 2)?;
        s.serialize_field("event", self.name())?;
        match self {
            Self::Connected(e) => s.serialize_field("data", e)?,
            Self::Disconnected(e) => s.serialize_field("data", e)?,
            Self::Error(e) => s.serialize_field("data", e)?,
            Self::StateChanged(e) => s.serialize_field("data", e)?,
            Self::Domain(e) => s.serialize_field("data", &e.payload)?,
            Self::Custom(e) => s.serialize_field("data", e)?,
        }
        s.end()
    }
}

// =============================================================================
// MULTIPLEXER
// =============================================================================

/// Routes inbound named events to the public event surface
#[derive(Debug, Clone)]
pub struct EventMultiplexer {
    known: HashSet<String>,
}

impl EventMultiplexer {
    pub fn new<I, S>(known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: known.into_iter().map(Into::into).collect(),
        }
    }

    /// Map one inbound event to its published form.
    ///
    /// Returns `None` for transport bookkeeping names (`connect*`,
    /// `disconnect*`), which the lifecycle events already cover.
    pub fn route(&self, name: String, payload: Value) -> Option<RealtimeEvent> {
        if self.known.contains(&name) {
            return Some(RealtimeEvent::Domain(DomainEvent { name, payload }));
        }

        if name.starts_with("connect") || name.starts_with("disconnect") {
            debug!(event = %name, "bookkeeping event not forwarded");
            return None;
        }

        Some(RealtimeEvent::Custom(CustomEvent {
            event_name: name,
            payload,
        }))
    }
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

pub type EventHandler = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Event name -> ordered handler list. Independent of connection lifecycle.
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, EventHandler)>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, event_name: impl Into<String>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(event_name.into())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a handler. Unknown ids are a no-op returning `false`.
    pub fn unsubscribe(&self, event_name: &str, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(event_name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event_name);
        }
        removed
    }

    pub fn handler_count(&self, event_name: &str) -> usize {
        self.handlers.read().get(event_name).map_or(0, Vec::len)
    }

    /// Invoke the handlers for `event`: exact-name handlers first, then
    /// wildcard handlers, each list in registration order.
    ///
    /// Handlers run outside the registry lock so they may subscribe or
    /// unsubscribe re-entrantly. A panicking handler is logged and skipped.
    pub fn dispatch(&self, event: &RealtimeEvent) {
        let targets: Vec<EventHandler> = {
            let handlers = self.handlers.read();
            let named = handlers.get(event.name()).into_iter().flatten();
            let wildcard = handlers.get(WILDCARD).into_iter().flatten();
            named.chain(wildcard).map(|(_, h)| h.clone()).collect()
        };

        for handler in targets {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(event = event.name(), "event handler panicked");
            }
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        let counts: HashMap<&str, usize> = handlers.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("SubscriptionRegistry").field("handlers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn mux() -> EventMultiplexer {
        EventMultiplexer::new(["ai_progress", "msgprint"])
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> EventHandler {
        let log = log.clone();
        Arc::new(move |event: &RealtimeEvent| log.lock().push(format!("{tag}:{}", event.name())))
    }

    #[test]
    fn test_known_event_forwarded_verbatim() {
        let routed = mux().route("ai_progress".into(), json!({"type": "step"})).unwrap();
        assert_eq!(
            routed,
            RealtimeEvent::Domain(DomainEvent {
                name: "ai_progress".into(),
                payload: json!({"type": "step"}),
            })
        );
    }

    #[test]
    fn test_unknown_event_becomes_custom() {
        let routed = mux().route("build_done".into(), json!([1, 2])).unwrap();
        assert_eq!(routed.name(), EVENT_CUSTOM);
        match routed {
            RealtimeEvent::Custom(custom) => {
                assert_eq!(custom.event_name, "build_done");
                assert_eq!(custom.payload, json!([1, 2]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_bookkeeping_names_not_forwarded() {
        assert!(mux().route("connect".into(), Value::Null).is_none());
        assert!(mux().route("connect_error".into(), Value::Null).is_none());
        assert!(mux().route("disconnecting".into(), Value::Null).is_none());
    }

    #[test]
    fn test_dispatch_order_and_wildcard() {
        let registry = SubscriptionRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.subscribe(WILDCARD, recorder(&log, "all"));
        registry.subscribe("msgprint", recorder(&log, "first"));
        registry.subscribe("msgprint", recorder(&log, "second"));

        let event = mux().route("msgprint".into(), json!("hi")).unwrap();
        registry.dispatch(&event);

        assert_eq!(
            *log.lock(),
            vec!["first:msgprint", "second:msgprint", "all:msgprint"]
        );
    }

    #[test]
    fn test_unsubscribe_unknown_is_noop() {
        let registry = SubscriptionRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let keep = registry.subscribe("msgprint", recorder(&log, "keep"));

        assert!(!registry.unsubscribe("msgprint", SubscriptionId(999)));
        assert!(!registry.unsubscribe("never_registered", keep));
        assert_eq!(registry.handler_count("msgprint"), 1);

        registry.dispatch(&mux().route("msgprint".into(), Value::Null).unwrap());
        assert_eq!(*log.lock(), vec!["keep:msgprint"]);

        assert!(registry.unsubscribe("msgprint", keep));
        assert!(!registry.unsubscribe("msgprint", keep));
        assert_eq!(registry.handler_count("msgprint"), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let registry = SubscriptionRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.subscribe("msgprint", Arc::new(|_: &RealtimeEvent| panic!("boom")));
        registry.subscribe("msgprint", recorder(&log, "ok"));

        registry.dispatch(&mux().route("msgprint".into(), Value::Null).unwrap());
        assert_eq!(*log.lock(), vec!["ok:msgprint"]);
    }

    #[test]
    fn test_event_json_shape() {
        let event = RealtimeEvent::Custom(CustomEvent {
            event_name: "x".into(),
            payload: json!({"a": 1}),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "custom_event");
        assert_eq!(json["data"]["event_name"], "x");
        assert_eq!(json["data"]["payload"]["a"], 1);
    }
}
