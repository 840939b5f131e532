//! Notification surface exposed to the embedding application.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use sessionlink_protocol::{ConnectionState, HostConfig};

use crate::types::{ConnectionError, ConnectionEvent, InboundMessage};

/// Receives notifications from a [`ConnectionManager`](crate::ConnectionManager).
///
/// All methods are called from the manager's driver task, one at a time and
/// in order. They must not block.
pub trait ConnectionHandler: Send + Sync {
    /// A payload arrived on the open message channel.
    fn on_message(&self, message: InboundMessage);

    /// The connection entered `state`. `error` describes the failure that
    /// caused the change, if any.
    fn on_connection_state_change(&self, state: ConnectionState, error: Option<&str>);

    /// A retry is about to wait `delay` after `total_tries` consecutive
    /// failures, the latest described by `error`.
    fn on_retry(&self, total_tries: u32, error: &ConnectionError, delay: Duration);

    /// A health check succeeded and the host published this configuration.
    fn on_host_config(&self, _config: &HostConfig) {}
}

/// Forwards every notification as a [`ConnectionEvent`] on an mpsc channel.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelHandler {
    /// Creates the handler and the receiving half of its event channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ConnectionEvent) {
        if self.tx.send(event).is_err() {
            warn!("event receiver dropped, notification lost");
        }
    }
}

impl ConnectionHandler for ChannelHandler {
    fn on_message(&self, message: InboundMessage) {
        self.forward(ConnectionEvent::Message(message));
    }

    fn on_connection_state_change(&self, state: ConnectionState, error: Option<&str>) {
        self.forward(ConnectionEvent::StateChanged {
            state,
            error: error.map(str::to_string),
        });
    }

    fn on_retry(&self, total_tries: u32, error: &ConnectionError, delay: Duration) {
        self.forward(ConnectionEvent::Retry {
            total_tries,
            error: error.clone(),
            delay,
        });
    }

    fn on_host_config(&self, config: &HostConfig) {
        self.forward(ConnectionEvent::HostConfig(config.clone()));
    }
}

/// Single dispatch point for outbound notifications.
///
/// Drops everything once the manager's cancellation token fires, so no
/// handler method runs after teardown.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    handler: Arc<dyn ConnectionHandler>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(handler: Arc<dyn ConnectionHandler>, cancel: CancellationToken) -> Self {
        Self { handler, cancel }
    }

    pub(crate) fn dispatch(&self, event: ConnectionEvent) {
        if self.cancel.is_cancelled() {
            trace!(?event, "manager torn down, dropping notification");
            return;
        }
        match event {
            ConnectionEvent::StateChanged { state, error } => {
                self.handler.on_connection_state_change(state, error.as_deref());
            }
            ConnectionEvent::Message(message) => self.handler.on_message(message),
            ConnectionEvent::Retry {
                total_tries,
                error,
                delay,
            } => self.handler.on_retry(total_tries, &error, delay),
            ConnectionEvent::HostConfig(config) => self.handler.on_host_config(&config),
        }
    }
}
