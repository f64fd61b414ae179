//! Connection lifecycle state machine.
//!
//! Owns the current [`ConnectionState`] and the table of legal transitions.
//! Every accepted transition produces a [`StateChange`] notification; the
//! manager queues it before releasing its lock so notifications keep
//! transition order.

use serde::Serialize;
use tracing::{info, warn};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }

    /// States from which the host may offer a manual retry
    pub fn can_retry(&self) -> bool {
        matches!(self, Self::Error | Self::Disconnected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra context attached to a transition
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransitionDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub manual: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub give_up: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl TransitionDetails {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Caller-initiated transition
    pub fn manual(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            manual: true,
            ..Default::default()
        }
    }
}

/// Payload of `connection_state_changed`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub state: ConnectionState,
    pub previous_state: ConnectionState,
    pub reconnect_attempts: u32,
    pub max_attempts: u32,
    #[serde(flatten)]
    pub details: TransitionDetails,
}

/// Rejected transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal state transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

/// Whether `from -> to` is a legal lifecycle transition
pub fn is_allowed(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    match (from, to) {
        // disconnect() is safe from anywhere
        (_, Disconnected) => true,
        (Disconnected | Reconnecting | Error, Connecting) => true,
        (Connecting, Connected) => true,
        (Connecting, Error) => true,
        (Disconnected | Error, Reconnecting) => true,
        // attempt ceiling reached
        (Reconnecting | Disconnected | Error, Error) => true,
        _ => false,
    }
}

/// Lifecycle state holder
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Apply a transition, returning the notification to emit.
    ///
    /// `reconnect_attempts` and `max_attempts` are snapshotted from the
    /// scheduler at the time of the transition.
    pub fn transition(
        &mut self,
        to: ConnectionState,
        details: TransitionDetails,
        reconnect_attempts: u32,
        max_attempts: u32,
    ) -> Result<StateChange, TransitionError> {
        let from = self.state;
        if !is_allowed(from, to) {
            warn!(from = %from, to = %to, "rejected_transition");
            return Err(TransitionError { from, to });
        }

        self.state = to;

        info!(
            from = %from,
            to = %to,
            attempts = reconnect_attempts,
            max_attempts,
            reason = details.reason.as_deref().unwrap_or(""),
            "connection_transition"
        );

        Ok(StateChange {
            state: to,
            previous_state: from,
            reconnect_attempts,
            max_attempts,
            details,
        })
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
