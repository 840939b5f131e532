//! Reconnecting client for a backend session.
//!
//! Probes candidate base URIs with health checks, opens a WebSocket message
//! channel at the first one that answers, and keeps it alive with bounded
//! exponential backoff. State changes, retries and inbound payloads are
//! reported through a [`ConnectionHandler`].

pub mod channel;
mod driver;
pub mod fsm;
pub mod handler;
pub mod manager;
pub mod prober;
mod pumps;
pub mod retry;
#[cfg(test)]
mod testing;
pub mod transport;
pub mod types;

pub use channel::{ChannelError, ChannelSender, CloseReason, MessageChannel};
pub use handler::{ChannelHandler, ConnectionHandler};
pub use manager::{ConnectionManager, ManagerError};
pub use prober::UriProber;
pub use retry::RetryScheduler;
pub use transport::{NetworkTransport, Transport};
pub use types::{
    BaseUri, ConfigError, ConnectionConfig, ConnectionError, ConnectionEvent, InboundMessage,
    RetryConfig,
};

pub use sessionlink_protocol::{ConnectionState, Event, HostConfig};
