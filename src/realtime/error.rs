//! Error taxonomy for the realtime connection.
//!
//! Connection failures never cross the public API as `Err`; they are carried
//! inside `error` events. The enum exists so hosts can match on the failure
//! class of an [`crate::realtime::RealtimeEvent::Error`].

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RealtimeError {
    /// No resolvable session identifier. Not retried.
    MissingCredentials { key: String },
    /// Transport or namespace handshake rejected
    Handshake { message: String },
    /// Handshake did not complete within the fixed timeout
    HandshakeTimeout { timeout_ms: u64 },
    /// Attempt ceiling reached; needs a manual retry
    ExhaustedRetries { attempts: u32 },
    /// No live session for an outbound send
    NotConnected,
    /// Malformed Engine.IO / Socket.IO packet
    Protocol { message: String },
    /// Socket-level failure after the handshake
    Transport { message: String },
}

impl RealtimeError {
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    pub fn handshake_timeout(timeout: Duration) -> Self {
        Self::HandshakeTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Whether the reconnection scheduler should try again after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Handshake { .. }
                | Self::HandshakeTimeout { .. }
                | Self::Protocol { .. }
                | Self::Transport { .. }
        )
    }
}

impl std::fmt::Display for RealtimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingCredentials { key } => {
                write!(f, "No session ID found ('{}' cookie missing) - please sign in first", key)
            }
            Self::Handshake { message } => write!(f, "{}", message),
            Self::HandshakeTimeout { timeout_ms } => {
                write!(f, "handshake timed out after {}ms", timeout_ms)
            }
            Self::ExhaustedRetries { attempts } => {
                write!(f, "Failed to connect after {} attempts", attempts)
            }
            Self::NotConnected => write!(f, "not connected"),
            Self::Protocol { message } => write!(f, "protocol error: {}", message),
            Self::Transport { message } => write!(f, "transport error: {}", message),
        }
    }
}

impl std::error::Error for RealtimeError {}
