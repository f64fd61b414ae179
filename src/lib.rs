//! Realtime Link
//!
//! Resilient client for a Socket.IO event endpoint:
//! - Authenticated session from a host-supplied cookie string
//! - Exponential backoff reconnection with an attempt ceiling
//! - Named event fan-out to subscribers, surviving reconnects

pub mod realtime;

pub use realtime::{
    ConnectionInfo, ConnectionState, ConnectionStatus, RealtimeConfig, RealtimeError,
    RealtimeEvent, RealtimeManager,
};
