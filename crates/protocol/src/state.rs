//! Connection lifecycle states and the events that move between them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle stage of a logical connection to a backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Created, nothing attempted yet.
    Initial,
    /// Probing candidate base URIs with health checks.
    PingingServer,
    /// WebSocket handshake in progress at the winning URI.
    Connecting,
    /// Message channel open.
    Connected,
    /// Terminal. The session cannot be recovered.
    DisconnectedForever,
}

impl ConnectionState {
    /// Upper snake case name, as shown to users and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::PingingServer => "PINGING_SERVER",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::DisconnectedForever => "DISCONNECTED_FOREVER",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::DisconnectedForever)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger for a state transition. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    Initialized,
    ConnectionClosed,
    ConnectionError,
    ConnectionSucceeded,
    ConnectionTimedOut,
    ServerPingSucceeded,
    /// Unrecoverable. Only a protocol incompatibility or an internal
    /// defect raises this.
    FatalError,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::ConnectionSucceeded => "CONNECTION_SUCCEEDED",
            Self::ConnectionTimedOut => "CONNECTION_TIMED_OUT",
            Self::ServerPingSucceeded => "SERVER_PING_SUCCEEDED",
            Self::FatalError => "FATAL_ERROR",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
