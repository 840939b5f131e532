//! The connection driver: one task that owns the state machine.
//!
//! Contains the shared [`LinkContext`] handed over by the manager and the
//! loop that walks the transition table, probing, opening the channel and
//! pumping it until a fatal error or teardown.

use std::ops::ControlFlow;
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sessionlink_protocol::{ConnectionState, Event, HostConfig};

use crate::channel::{ChannelError, ChannelEvent, ChannelSender, MessageChannel};
use crate::fsm::{self, Transition};
use crate::handler::Dispatcher;
use crate::prober::UriProber;
use crate::retry::RetryScheduler;
use crate::transport::Transport;
use crate::types::{ConnectionConfig, ConnectionError, ConnectionEvent};

/// State shared between the manager and its driver task.
#[derive(Clone)]
pub(crate) struct LinkContext {
    pub(crate) config: ConnectionConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) prober: Arc<UriProber>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: Arc<RwLock<ConnectionState>>,
    pub(crate) outbound: Arc<Mutex<Option<ChannelSender>>>,
    pub(crate) session_id: Arc<std::sync::Mutex<Option<String>>>,
    pub(crate) host_config: Arc<RwLock<Option<HostConfig>>>,
}

impl LinkContext {
    fn current_session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Runs the connection until it is disconnected forever or cancelled.
pub(crate) async fn run(ctx: LinkContext) {
    let retry = RetryScheduler::new(ctx.config.retry.clone());
    let driver = Driver {
        ctx,
        state: ConnectionState::Initial,
        winner: 0,
        channel: None,
        pending_failure: None,
        retry,
    };
    driver.run().await;
}

struct Driver {
    ctx: LinkContext,
    state: ConnectionState,
    /// Index of the candidate that answered the last ping.
    winner: usize,
    channel: Option<MessageChannel>,
    /// Failure to back off from before the next ping cycle.
    pending_failure: Option<ConnectionError>,
    retry: RetryScheduler,
}

impl Driver {
    async fn run(mut self) {
        self.step(Event::Initialized, None).await;

        loop {
            if self.ctx.cancel.is_cancelled() {
                break;
            }
            let flow = match self.state {
                ConnectionState::PingingServer => self.ping_server().await,
                ConnectionState::Connecting => self.connect().await,
                ConnectionState::Connected => self.pump_channel().await,
                ConnectionState::Initial | ConnectionState::DisconnectedForever => {
                    ControlFlow::Break(())
                }
            };
            if flow.is_break() {
                break;
            }
        }

        self.teardown().await;
    }

    /// Feeds `event` to the state machine and publishes the new state.
    async fn step(&mut self, event: Event, error: Option<String>) {
        match fsm::transition(self.state, event) {
            Transition::To(next) => self.enter(next, error).await,
            Transition::Ignored => {
                debug!(state = %self.state, event = %event, "event ignored");
            }
            Transition::Unsupported => {
                let msg = format!(
                    "Unsupported state transition.\nState: {}\nEvent: {}",
                    self.state, event
                );
                error!(state = %self.state, event = %event, "unsupported state transition");
                self.enter(ConnectionState::DisconnectedForever, Some(msg))
                    .await;
            }
        }
    }

    async fn enter(&mut self, next: ConnectionState, error: Option<String>) {
        info!(from = %self.state, to = %next, "connection state changed");
        self.state = next;
        *self.ctx.state.write().await = next;
        self.ctx
            .dispatcher
            .dispatch(ConnectionEvent::StateChanged { state: next, error });
    }

    async fn ping_server(&mut self) -> ControlFlow<()> {
        if let Some(failure) = self.pending_failure.take()
            && self
                .retry
                .backoff(failure, &self.ctx.dispatcher, &self.ctx.cancel)
                .await
                .is_err()
        {
            return ControlFlow::Break(());
        }

        let Ok(success) = self
            .ctx
            .prober
            .probe(&mut self.retry, &self.ctx.dispatcher, &self.ctx.cancel)
            .await
        else {
            return ControlFlow::Break(());
        };

        self.winner = success.index;
        *self.ctx.host_config.write().await = Some(success.host_config.clone());
        self.ctx
            .dispatcher
            .dispatch(ConnectionEvent::HostConfig(success.host_config));
        self.step(Event::ServerPingSucceeded, None).await;
        ControlFlow::Continue(())
    }

    async fn connect(&mut self) -> ControlFlow<()> {
        let Some(base) = self.ctx.prober.candidate(self.winner).cloned() else {
            self.step(
                Event::FatalError,
                Some(format!("no candidate at index {}", self.winner)),
            )
            .await;
            return ControlFlow::Continue(());
        };
        let session_id = self.ctx.current_session_id();
        info!(uri = %base, "opening message channel");

        let open = self.ctx.transport.open(&base, session_id.as_deref());
        let result = tokio::select! {
            _ = self.ctx.cancel.cancelled() => return ControlFlow::Break(()),
            r = tokio::time::timeout(self.ctx.config.connect_timeout, open) => r,
        };

        match result {
            Ok(Ok(channel)) => {
                *self.ctx.outbound.lock().await = Some(channel.sender());
                self.channel = Some(channel);
                self.retry.reset();
                info!(uri = %base, "message channel open");
                self.step(Event::ConnectionSucceeded, None).await;
            }
            Ok(Err(ChannelError::Incompatible(reason))) => {
                error!(uri = %base, reason = %reason, "server is incompatible, giving up");
                self.step(Event::FatalError, Some(reason)).await;
            }
            Ok(Err(e)) => {
                let failure = e.description();
                warn!(uri = %base, error = %e, "failed to open message channel");
                let msg = failure.to_string();
                self.pending_failure = Some(failure);
                self.step(Event::ConnectionError, Some(msg)).await;
            }
            Err(_) => {
                warn!(uri = %base, timeout = ?self.ctx.config.connect_timeout, "channel open timed out");
                let failure = ConnectionError::TimedOut;
                let msg = failure.to_string();
                self.pending_failure = Some(failure);
                self.step(Event::ConnectionTimedOut, Some(msg)).await;
            }
        }
        ControlFlow::Continue(())
    }

    async fn pump_channel(&mut self) -> ControlFlow<()> {
        let Some(channel) = self.channel.as_mut() else {
            let failure = ConnectionError::Closed("no open channel".into());
            let msg = failure.to_string();
            self.pending_failure = Some(failure);
            self.step(Event::ConnectionClosed, Some(msg)).await;
            return ControlFlow::Continue(());
        };

        let event = tokio::select! {
            _ = self.ctx.cancel.cancelled() => return ControlFlow::Break(()),
            ev = channel.next_event() => ev,
        };

        match event {
            ChannelEvent::Message(message) => {
                self.ctx.dispatcher.dispatch(ConnectionEvent::Message(message));
            }
            ChannelEvent::Closed(reason) => {
                self.channel = None;
                *self.ctx.outbound.lock().await = None;
                warn!(reason = %reason, "message channel closed");
                let failure = reason.description();
                let msg = failure.to_string();
                self.pending_failure = Some(failure);
                self.step(reason.event(), Some(msg)).await;
            }
        }
        ControlFlow::Continue(())
    }

    async fn teardown(&mut self) {
        *self.ctx.outbound.lock().await = None;
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        debug!(state = %self.state, "connection driver stopped");
    }
}
