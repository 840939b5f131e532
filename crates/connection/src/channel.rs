//! Duplex message channel over a WebSocket.
//!
//! Spawns a read pump and a write pump (which also sends keepalive pings)
//! around an established stream.
//! Inbound payloads and the final close reason are queued for the channel
//! owner; outbound payloads go through a cloneable [`ChannelSender`].

use std::fmt;

use futures_util::{Sink, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use sessionlink_protocol::Event;
use sessionlink_protocol::constants::{WS_PING_PERIOD, WS_SUBPROTOCOL};

use crate::pumps::{read::read_pump, write::write_pump};
use crate::types::{ConnectionError, InboundMessage};

/// Errors from the message channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    /// The server cannot speak this client's protocol. Not retryable.
    #[error("incompatible server: {0}")]
    Incompatible(String),

    #[error("session id is not a valid header value")]
    InvalidSessionId,

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,
}

impl ChannelError {
    /// Classifies a handshake failure, separating protocol incompatibility
    /// from transient errors.
    pub fn from_handshake(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Protocol(ProtocolError::SecWebSocketSubProtocolError(e)) => {
                Self::Incompatible(format!(
                    "server did not accept the {WS_SUBPROTOCOL:?} subprotocol ({e})"
                ))
            }
            other => Self::Ws(other),
        }
    }

    /// Description shown to users when this failure triggers a retry.
    pub fn description(&self) -> ConnectionError {
        match self {
            Self::Closed => ConnectionError::Closed("closed during handshake".into()),
            other => ConnectionError::Channel(other.to_string()),
        }
    }
}

/// Why an open channel stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server sent a close frame.
    Remote { code: Option<u16>, reason: String },
    /// The stream ended without a close frame.
    Ended,
    /// Transport error while reading.
    Error(String),
    /// Nothing arrived within the read deadline.
    ReadTimeout,
    /// This side shut the channel down.
    ClosedByClient,
}

impl CloseReason {
    /// State-machine event raised by this close.
    pub fn event(&self) -> Event {
        match self {
            Self::Remote { .. } | Self::Ended | Self::ClosedByClient => Event::ConnectionClosed,
            Self::Error(_) | Self::ReadTimeout => Event::ConnectionError,
        }
    }

    pub fn description(&self) -> ConnectionError {
        match self {
            Self::Error(e) => ConnectionError::Channel(e.clone()),
            Self::ReadTimeout => ConnectionError::TimedOut,
            other => ConnectionError::Closed(other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote {
                code: Some(code),
                reason,
            } if !reason.is_empty() => write!(f, "server closed the channel ({code}: {reason})"),
            Self::Remote {
                code: Some(code), ..
            } => write!(f, "server closed the channel ({code})"),
            Self::Remote { code: None, .. } => f.write_str("server closed the channel"),
            Self::Ended => f.write_str("stream ended"),
            Self::Error(e) => write!(f, "read error: {e}"),
            Self::ReadTimeout => f.write_str("no data within the read deadline"),
            Self::ClosedByClient => f.write_str("closed by client"),
        }
    }
}

/// Something the read pump reports to the channel owner.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChannelEvent {
    Message(InboundMessage),
    Closed(CloseReason),
}

/// Cloneable handle for sending payloads on an open channel.
#[derive(Clone)]
pub struct ChannelSender {
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
}

impl ChannelSender {
    /// Queues an opaque payload as a binary frame.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        self.write_tx
            .send(tungstenite::Message::Binary(data.into()))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Tears the channel down. The owner sees
    /// [`CloseReason::ClosedByClient`].
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

/// An open duplex channel. Dropping it stops all pumps.
pub struct MessageChannel {
    sender: ChannelSender,
    events_rx: mpsc::Receiver<ChannelEvent>,
    cancel: CancellationToken,
    read_handle: JoinHandle<()>,
    /// Not aborted on drop so the Close frame still goes out.
    _write_handle: JoinHandle<()>,
}

impl MessageChannel {
    /// Takes over an established WebSocket stream.
    pub fn spawn<S>(ws: S) -> Self
    where
        S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
            + Sink<tungstenite::Message, Error = tungstenite::Error>
            + Unpin
            + Send
            + 'static,
    {
        let (write, read) = ws.split();
        Self::from_parts(read, write)
    }

    /// Builds a channel from separate read and write halves.
    pub fn from_parts<R, W>(read: R, write: W) -> Self
    where
        R: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin + Send + 'static,
        W: Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin + Send + 'static,
    {
        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let (events_tx, events_rx) = mpsc::channel::<ChannelEvent>(256);
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(write_pump(
            write,
            write_rx,
            cancel.clone(),
            WS_PING_PERIOD,
        ));
        let read_handle = tokio::spawn(read_pump(
            read,
            events_tx,
            write_tx.clone(),
            cancel.clone(),
        ));

        Self {
            sender: ChannelSender {
                write_tx,
                cancel: cancel.clone(),
            },
            events_rx,
            cancel,
            read_handle,
            _write_handle: write_handle,
        }
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    /// Waits for the next inbound payload or the close of the channel.
    pub(crate) async fn next_event(&mut self) -> ChannelEvent {
        self.events_rx
            .recv()
            .await
            .unwrap_or(ChannelEvent::Closed(CloseReason::Ended))
    }

    /// Closes the channel. The write pump sends a Close frame on its way out.
    pub fn close(self) {
        debug!("closing message channel");
        self.cancel.cancel();
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
    }
}
