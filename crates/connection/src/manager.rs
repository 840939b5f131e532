//! Connection manager owning the lifecycle of one logical connection.
//!
//! Probes the candidate URIs, opens the message channel at the winner,
//! reports state changes and inbound payloads to a [`ConnectionHandler`],
//! and reconnects with bounded exponential backoff whenever anything fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sessionlink_protocol::{ConnectionState, HostConfig};

use crate::channel::{ChannelError, ChannelSender};
use crate::driver::{self, LinkContext};
use crate::handler::{ConnectionHandler, Dispatcher};
use crate::prober::UriProber;
use crate::transport::{NetworkTransport, Transport};
use crate::types::{ConfigError, ConnectionConfig};

/// Errors from manager lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("connection manager already started")]
    AlreadyStarted,

    #[error("connection manager has been shut down")]
    ShutDown,

    #[error("driver task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Keeps one logical connection to a backend session alive.
///
/// Dropping the manager cancels the driver without waiting for it, so a
/// notification already in flight may still reach the handler. Call
/// [`shutdown`](Self::shutdown) to be sure no handler method runs after
/// teardown.
pub struct ConnectionManager {
    ctx: LinkContext,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ConnectionManager {
    /// Creates a manager that talks to the network.
    pub fn new(
        config: ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self, ConfigError> {
        let transport = NetworkTransport::new(config.ping_timeout, config.max_message_size)?;
        Self::with_transport(config, handler, Arc::new(transport))
    }

    /// Creates a manager on top of a custom transport.
    pub fn with_transport(
        config: ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let prober = UriProber::new(
            config.base_uris.clone(),
            Arc::clone(&transport),
            config.ping_timeout,
        )?;
        let session_id = config.session_id.clone();

        let ctx = LinkContext {
            config,
            transport,
            prober: Arc::new(prober),
            dispatcher: Dispatcher::new(handler, cancel.clone()),
            cancel,
            state: Arc::new(RwLock::new(ConnectionState::Initial)),
            outbound: Arc::new(Mutex::new(None)),
            session_id: Arc::new(std::sync::Mutex::new(session_id)),
            host_config: Arc::new(RwLock::new(None)),
        };

        Ok(Self {
            ctx,
            driver: std::sync::Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Spawns the driver task. The manager starts probing immediately.
    pub fn start(&self) -> Result<(), ManagerError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(ManagerError::ShutDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyStarted);
        }

        info!(
            candidates = self.ctx.config.base_uris.len(),
            "starting connection manager"
        );
        let handle = tokio::spawn(driver::run(self.ctx.clone()));
        *self.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Returns the current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.ctx.state.read().await
    }

    /// Returns the host configuration from the latest successful ping.
    pub async fn host_config(&self) -> Option<HostConfig> {
        self.ctx.host_config.read().await.clone()
    }

    /// Sets the session to resume on the next channel open.
    pub fn set_session_id(&self, session_id: Option<String>) {
        debug!(resume = session_id.is_some(), "session id updated");
        *self
            .ctx
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = session_id;
    }

    /// Sends an opaque payload on the open channel.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), ChannelError> {
        let sender = self.sender().await.ok_or(ChannelError::NotConnected)?;
        sender.send(data).await
    }

    /// Drops the live channel, if any. The driver treats this like any
    /// other close and reconnects.
    pub async fn force_disconnect(&self) {
        match self.sender().await {
            Some(sender) => {
                warn!("forcing disconnect of the message channel");
                sender.disconnect();
            }
            None => debug!("force_disconnect: no open channel"),
        }
    }

    /// Stops the driver and waits for it to finish. No handler method is
    /// called after this returns.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        self.ctx.cancel.cancel();
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.await?;
            info!("connection manager shut down");
        }
        Ok(())
    }

    async fn sender(&self) -> Option<ChannelSender> {
        self.ctx.outbound.lock().await.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.ctx.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::handler::ChannelHandler;
    use crate::testing::{FakePeer, OpenStep, PingStep, ScriptedTransport};
    use crate::types::{ConnectionError, ConnectionEvent, InboundMessage};

    struct Harness {
        manager: ConnectionManager,
        transport: Arc<ScriptedTransport>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        peers: mpsc::UnboundedReceiver<FakePeer>,
    }

    fn harness(uris: &[&str], script: impl FnOnce(&ScriptedTransport)) -> Harness {
        let (transport, peers) = ScriptedTransport::new();
        script(transport.as_ref());
        let (handler, events) = ChannelHandler::new();
        let config = ConnectionConfig::new(uris.iter().copied()).unwrap();
        let manager =
            ConnectionManager::with_transport(config, Arc::new(handler), transport.clone())
                .unwrap();
        Harness {
            manager,
            transport,
            events,
            peers,
        }
    }

    /// Receives events until `state` is entered, returning everything seen.
    async fn until_state(
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
        state: ConnectionState,
    ) -> Vec<ConnectionEvent> {
        let mut seen = Vec::new();
        while let Some(ev) = events.recv().await {
            let done = matches!(&ev, ConnectionEvent::StateChanged { state: s, .. } if *s == state);
            seen.push(ev);
            if done {
                return seen;
            }
        }
        panic!("event stream ended before {state}; saw {seen:?}");
    }

    fn states(events: &[ConnectionEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|ev| match ev {
                ConnectionEvent::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn retries(events: &[ConnectionEvent]) -> Vec<(u32, ConnectionError, Duration)> {
        events
            .iter()
            .filter_map(|ev| match ev {
                ConnectionEvent::Retry {
                    total_tries,
                    error,
                    delay,
                } => Some((*total_tries, error.clone(), *delay)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn falls_through_to_second_candidate() {
        let mut h = harness(&["http://a", "http://b"], |t| {
            t.script_ping("http://a", [PingStep::Hang]);
        });
        h.manager.start().unwrap();

        let seen = until_state(&mut h.events, ConnectionState::Connected).await;
        assert_eq!(
            states(&seen),
            vec![
                ConnectionState::PingingServer,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
        assert_eq!(
            retries(&seen),
            vec![(1, ConnectionError::TimedOut, Duration::from_millis(500))]
        );
        assert_eq!(h.transport.pings(), vec!["http://a/", "http://b/"]);
        assert_eq!(h.manager.state().await, ConnectionState::Connected);
        assert_eq!(h.manager.host_config().await, Some(HostConfig::default()));

        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drop_after_connected_retries_then_reprobes() {
        let mut h = harness(&["http://a"], |_| {});
        h.manager.start().unwrap();
        until_state(&mut h.events, ConnectionState::Connected).await;

        let peer = h.peers.recv().await.unwrap();
        drop(peer);

        let seen = until_state(&mut h.events, ConnectionState::Connected).await;
        assert_eq!(
            states(&seen),
            vec![
                ConnectionState::PingingServer,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
        let retries = retries(&seen);
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].0, 1);
        assert_eq!(retries[0].2, Duration::from_millis(500));
        assert_eq!(h.transport.pings().len(), 2);

        // The retry is reported before the second probe's host config.
        let retry_pos = seen
            .iter()
            .position(|ev| matches!(ev, ConnectionEvent::Retry { .. }))
            .unwrap();
        let host_pos = seen
            .iter()
            .position(|ev| matches!(ev, ConnectionEvent::HostConfig(_)))
            .unwrap();
        assert!(retry_pos < host_pos);

        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_messages_and_sends_payloads() {
        let mut h = harness(&["http://a"], |_| {});
        h.manager.start().unwrap();
        until_state(&mut h.events, ConnectionState::Connected).await;
        let mut peer = h.peers.recv().await.unwrap();

        peer.send_binary(b"first");
        peer.send_binary(b"second");
        let mut messages = Vec::new();
        while messages.len() < 2 {
            if let Some(ConnectionEvent::Message(m)) = h.events.recv().await {
                messages.push(m);
            }
        }
        assert_eq!(
            messages,
            vec![
                InboundMessage {
                    seq: 0,
                    data: b"first".to_vec()
                },
                InboundMessage {
                    seq: 1,
                    data: b"second".to_vec()
                },
            ]
        );

        h.manager.send(b"reply".to_vec()).await.unwrap();
        assert_eq!(peer.next_binary().await, Some(b"reply".to_vec()));

        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn incompatible_server_is_fatal() {
        let mut h = harness(&["http://a"], |t| {
            t.script_open([OpenStep::Incompatible("no streamlit subprotocol".into())]);
        });
        h.manager.start().unwrap();

        let seen = until_state(&mut h.events, ConnectionState::DisconnectedForever).await;
        assert!(retries(&seen).is_empty());
        assert_eq!(
            seen.last(),
            Some(&ConnectionEvent::StateChanged {
                state: ConnectionState::DisconnectedForever,
                error: Some("no streamlit subprotocol".into()),
            })
        );

        // The driver has stopped; nothing else is attempted.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.transport.opens().len(), 1);
        assert_eq!(h.transport.pings().len(), 1);
        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn refused_open_backs_off_and_retries() {
        let mut h = harness(&["http://a"], |t| {
            t.script_open([OpenStep::Refuse, OpenStep::Hang]);
        });
        h.manager.start().unwrap();

        let seen = until_state(&mut h.events, ConnectionState::Connected).await;
        assert_eq!(
            states(&seen),
            vec![
                ConnectionState::PingingServer,
                ConnectionState::Connecting,
                ConnectionState::PingingServer,
                ConnectionState::Connecting,
                ConnectionState::PingingServer,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
        let retries = retries(&seen);
        assert_eq!(retries.len(), 2);
        assert!(matches!(retries[0].1, ConnectionError::Channel(_)));
        assert_eq!(retries[0].2, Duration::from_millis(500));
        assert_eq!(retries[1], (2, ConnectionError::TimedOut, Duration::from_millis(1_000)));

        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_retry_streak() {
        let mut h = harness(&["http://a"], |t| {
            t.script_ping(
                "http://a",
                [
                    PingStep::Fail(ConnectionError::ServerUnreachable),
                    PingStep::Fail(ConnectionError::ServerUnreachable),
                    PingStep::Fail(ConnectionError::ServerUnreachable),
                ],
            );
        });
        h.manager.start().unwrap();
        let seen = until_state(&mut h.events, ConnectionState::Connected).await;
        let delays: Vec<_> = retries(&seen).into_iter().map(|r| r.2).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1_000),
                Duration::from_millis(2_000),
            ]
        );

        h.manager.force_disconnect().await;
        let seen = until_state(&mut h.events, ConnectionState::Connected).await;
        assert_eq!(
            retries(&seen)
                .into_iter()
                .map(|r| (r.0, r.2))
                .collect::<Vec<_>>(),
            vec![(1, Duration::from_millis(500))]
        );

        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn force_disconnect_reports_close_and_reconnects() {
        let mut h = harness(&["http://a"], |_| {});
        h.manager.start().unwrap();
        until_state(&mut h.events, ConnectionState::Connected).await;

        h.manager.force_disconnect().await;
        let seen = until_state(&mut h.events, ConnectionState::PingingServer).await;
        assert_eq!(
            seen.last(),
            Some(&ConnectionEvent::StateChanged {
                state: ConnectionState::PingingServer,
                error: Some("Connection closed: closed by client".into()),
            })
        );
        until_state(&mut h.events, ConnectionState::Connected).await;
        assert_eq!(h.transport.opens().len(), 2);

        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn no_notifications_after_shutdown() {
        let mut h = harness(&["http://a"], |t| {
            t.set_default_ping(PingStep::Fail(ConnectionError::LocalServerUnreachable));
        });
        h.manager.start().unwrap();
        until_state(&mut h.events, ConnectionState::PingingServer).await;

        h.manager.shutdown().await.unwrap();
        while h.events.try_recv().is_ok() {}

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn session_id_is_passed_to_open() {
        let mut h = harness(&["http://a"], |_| {});
        h.manager.set_session_id(Some("resume-me".into()));
        h.manager.start().unwrap();
        until_state(&mut h.events, ConnectionState::Connected).await;

        h.manager.set_session_id(Some("second".into()));
        h.manager.force_disconnect().await;
        until_state(&mut h.events, ConnectionState::Connected).await;

        assert_eq!(
            h.transport.opens(),
            vec![Some("resume-me".to_string()), Some("second".to_string())]
        );
        h.manager.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_channel_fails() {
        let h = harness(&["http://a"], |t| t.set_default_ping(PingStep::Hang));
        assert!(matches!(
            h.manager.send(vec![1]).await,
            Err(ChannelError::NotConnected)
        ));
        h.manager.start().unwrap();
        assert!(matches!(
            h.manager.send(vec![1]).await,
            Err(ChannelError::NotConnected)
        ));
        h.manager.shutdown().await.unwrap();
    }

    fn poison<T: Send>(lock: &std::sync::Mutex<T>) {
        std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = lock.lock();
                panic!("poisoning lock");
            })
            .join()
            .unwrap_err();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn poisoned_locks_keep_session_and_driver() {
        let mut h = harness(&["http://a"], |_| {});
        poison(&*h.manager.ctx.session_id);
        poison(&h.manager.driver);
        assert!(h.manager.ctx.session_id.is_poisoned());
        assert!(h.manager.driver.is_poisoned());

        h.manager.set_session_id(Some("kept".into()));
        h.manager.start().unwrap();
        until_state(&mut h.events, ConnectionState::Connected).await;
        assert_eq!(h.transport.opens(), vec![Some("kept".to_string())]);

        h.manager.shutdown().await.unwrap();
        assert!(
            h.manager
                .driver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_none()
        );
    }

    #[tokio::test]
    async fn lifecycle_errors() {
        let h = harness(&["http://a"], |t| t.set_default_ping(PingStep::Hang));
        assert_eq!(h.manager.state().await, ConnectionState::Initial);
        h.manager.start().unwrap();
        assert!(matches!(
            h.manager.start(),
            Err(ManagerError::AlreadyStarted)
        ));
        h.manager.shutdown().await.unwrap();
        assert!(matches!(h.manager.start(), Err(ManagerError::ShutDown)));
        // A second shutdown is a no-op.
        h.manager.shutdown().await.unwrap();
    }
}
