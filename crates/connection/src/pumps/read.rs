//! WebSocket read pump: delivers inbound payloads to the channel owner.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use sessionlink_protocol::constants::WS_PONG_WAIT;

use crate::channel::{ChannelEvent, CloseReason};
use crate::types::InboundMessage;

/// Reads frames from the WebSocket and forwards payloads in arrival order.
///
/// Any inbound frame pushes the read deadline back by [`WS_PONG_WAIT`]; if
/// nothing arrives in that window the channel is considered dead. The last
/// event sent is always [`ChannelEvent::Closed`].
pub(crate) async fn read_pump<S>(
    mut read: S,
    events_tx: mpsc::Sender<ChannelEvent>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let read_deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(read_deadline);
    let mut seq: u64 = 0;

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break CloseReason::ClosedByClient,

            () = &mut read_deadline => {
                warn!("read deadline expired, channel dead");
                break CloseReason::ReadTimeout;
            }

            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break CloseReason::Error(e.to_string());
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break CloseReason::Ended;
                    }
                };
                read_deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                let data = match msg {
                    tungstenite::Message::Binary(data) => data.to_vec(),
                    tungstenite::Message::Text(text) => text.as_bytes().to_vec(),
                    tungstenite::Message::Ping(data) => {
                        trace!("received ping, sending pong");
                        let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                        continue;
                    }
                    tungstenite::Message::Pong(_) => {
                        trace!("received pong");
                        continue;
                    }
                    tungstenite::Message::Close(frame) => {
                        debug!(?frame, "received close frame");
                        break match frame {
                            Some(f) => CloseReason::Remote {
                                code: Some(u16::from(f.code)),
                                reason: f.reason.to_string(),
                            },
                            None => CloseReason::Remote {
                                code: None,
                                reason: String::new(),
                            },
                        };
                    }
                    _ => continue,
                };

                trace!(seq, len = data.len(), "received message");
                let message = InboundMessage { seq, data };
                seq += 1;
                if events_tx.send(ChannelEvent::Message(message)).await.is_err() {
                    debug!("channel owner gone, stopping read pump");
                    break CloseReason::ClosedByClient;
                }
            }
        }
    };

    let _ = events_tx.send(ChannelEvent::Closed(reason)).await;
}
