//! Test doubles: an in-memory channel peer and a scripted transport.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures_util::future::{self, BoxFuture};
use futures_util::{FutureExt, sink, stream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use sessionlink_protocol::HostConfig;

use crate::channel::{ChannelError, MessageChannel};
use crate::transport::Transport;
use crate::types::{BaseUri, ConnectionError};

/// Far end of a [`duplex`] channel.
pub(crate) struct FakePeer {
    /// Frames the channel will read.
    pub inbound: mpsc::UnboundedSender<Result<tungstenite::Message, tungstenite::Error>>,
    /// Frames the channel wrote.
    pub outbound: mpsc::UnboundedReceiver<tungstenite::Message>,
}

impl FakePeer {
    pub fn send_binary(&self, data: &[u8]) {
        let _ = self
            .inbound
            .send(Ok(tungstenite::Message::Binary(data.to_vec().into())));
    }

    /// Next binary frame written by the client, skipping control frames.
    pub async fn next_binary(&mut self) -> Option<Vec<u8>> {
        while let Some(msg) = self.outbound.recv().await {
            if let tungstenite::Message::Binary(data) = msg {
                return Some(data.to_vec());
            }
        }
        None
    }
}

/// Builds a channel connected to an in-memory peer.
pub(crate) fn duplex() -> (MessageChannel, FakePeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<tungstenite::Message>();

    let read = Box::pin(stream::unfold(inbound_rx, |mut rx| async move {
        rx.recv().await.map(|msg| (msg, rx))
    }));
    let write = Box::pin(sink::unfold(
        outbound_tx,
        |tx, msg: tungstenite::Message| async move {
            tx.send(msg)
                .map_err(|_| tungstenite::Error::ConnectionClosed)?;
            Ok::<_, tungstenite::Error>(tx)
        },
    ));

    let channel = MessageChannel::from_parts(read, write);
    let peer = FakePeer {
        inbound: inbound_tx,
        outbound: outbound_rx,
    };
    (channel, peer)
}

#[derive(Debug, Clone)]
pub(crate) enum PingStep {
    Healthy,
    Fail(ConnectionError),
    /// Never answers.
    Hang,
}

#[derive(Debug, Clone)]
pub(crate) enum OpenStep {
    Accept,
    Refuse,
    Incompatible(String),
    Hang,
}

/// Transport whose outcomes are queued up front by the test.
///
/// Pings follow a per-candidate script, then `default_ping`. Opens follow a
/// shared script, then accept. Every accepted open hands its [`FakePeer`] to
/// the receiver returned by [`ScriptedTransport::new`].
pub(crate) struct ScriptedTransport {
    pings: Mutex<HashMap<String, VecDeque<PingStep>>>,
    default_ping: Mutex<PingStep>,
    opens: Mutex<VecDeque<OpenStep>>,
    ping_log: Mutex<Vec<String>>,
    open_log: Mutex<Vec<Option<String>>>,
    peers: mpsc::UnboundedSender<FakePeer>,
}

impl ScriptedTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakePeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            pings: Mutex::new(HashMap::new()),
            default_ping: Mutex::new(PingStep::Healthy),
            opens: Mutex::new(VecDeque::new()),
            ping_log: Mutex::new(Vec::new()),
            open_log: Mutex::new(Vec::new()),
            peers,
        });
        (transport, peers_rx)
    }

    /// Queues ping outcomes for `uri`.
    pub fn script_ping(&self, uri: &str, steps: impl IntoIterator<Item = PingStep>) {
        let key = BaseUri::parse(uri).unwrap().as_str().to_string();
        self.pings
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .extend(steps);
    }

    /// Outcome of every ping once its script runs out.
    pub fn set_default_ping(&self, step: PingStep) {
        *self.default_ping.lock().unwrap() = step;
    }

    pub fn script_open(&self, steps: impl IntoIterator<Item = OpenStep>) {
        self.opens.lock().unwrap().extend(steps);
    }

    /// Base URIs pinged so far, in order.
    pub fn pings(&self) -> Vec<String> {
        self.ping_log.lock().unwrap().clone()
    }

    /// Session ids passed to each open, in order.
    pub fn opens(&self) -> Vec<Option<String>> {
        self.open_log.lock().unwrap().clone()
    }

    fn next_ping(&self, base: &BaseUri) -> PingStep {
        self.ping_log.lock().unwrap().push(base.as_str().to_string());
        let scripted = self
            .pings
            .lock()
            .unwrap()
            .get_mut(base.as_str())
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| self.default_ping.lock().unwrap().clone())
    }

    fn next_open(&self, session_id: Option<&str>) -> OpenStep {
        self.open_log
            .lock()
            .unwrap()
            .push(session_id.map(str::to_string));
        self.opens
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(OpenStep::Accept)
    }
}

impl Transport for ScriptedTransport {
    fn ping<'a>(&'a self, base: &'a BaseUri) -> BoxFuture<'a, Result<HostConfig, ConnectionError>> {
        match self.next_ping(base) {
            PingStep::Healthy => future::ready(Ok(HostConfig::default())).boxed(),
            PingStep::Fail(error) => future::ready(Err(error)).boxed(),
            PingStep::Hang => future::pending().boxed(),
        }
    }

    fn open<'a>(
        &'a self,
        _base: &'a BaseUri,
        session_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<MessageChannel, ChannelError>> {
        match self.next_open(session_id) {
            OpenStep::Accept => {
                let (channel, peer) = duplex();
                let _ = self.peers.send(peer);
                future::ready(Ok(channel)).boxed()
            }
            OpenStep::Refuse => {
                let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
                future::ready(Err(ChannelError::Ws(tungstenite::Error::Io(refused)))).boxed()
            }
            OpenStep::Incompatible(reason) => {
                future::ready(Err(ChannelError::Incompatible(reason))).boxed()
            }
            OpenStep::Hang => future::pending().boxed(),
        }
    }
}
