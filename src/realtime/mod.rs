pub mod backoff;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod manager; // Connection manager façade
pub mod protocol; // Engine.IO / Socket.IO text codec
pub mod scheduler;
pub mod state;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use config::RealtimeConfig;
pub use credentials::{parse_cookies, Credentials};
pub use error::RealtimeError;
pub use events::{
    ConnectedEvent, CustomEvent, DisconnectedEvent, DomainEvent, ErrorEvent, EventHandler,
    RealtimeEvent, SubscriptionId, SubscriptionRegistry, WILDCARD,
};
pub use manager::{ConnectionInfo, ConnectionStatus, RealtimeManager, WeakRealtimeManager};
pub use state::{ConnectionState, StateChange, TransitionDetails};
pub use transport::{
    DisconnectReason, Handshake, SessionHandle, SessionSink, SocketIoTransport, Transport,
};
