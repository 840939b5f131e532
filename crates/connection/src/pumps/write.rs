//! Outbound half of a channel: queued frames plus idle keepalive pings.

use std::time::Duration;

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Drains `outbound` into the sink until cancelled or every sender is gone,
/// then sends a Close frame.
///
/// A ping goes out whenever nothing was written for `keepalive`, so the
/// peer keeps answering and the read deadline keeps moving. A failed write
/// ends the pump without a Close.
pub(crate) async fn write_pump<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
    keepalive: Duration,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let mut idle = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    idle.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut written: u64 = 0;

    let stop = loop {
        let (frame, is_ping) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break "cancelled",
            frame = outbound.recv() => match frame {
                Some(frame) => (frame, false),
                None => break "all senders dropped",
            },
            _ = idle.tick() => (tungstenite::Message::Ping(Vec::new().into()), true),
        };

        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, written, "WebSocket write failed");
            return;
        }
        if is_ping {
            trace!("keepalive ping sent");
        } else {
            written += 1;
            idle.reset();
        }
    };

    debug!(written, reason = stop, "write pump stopping");
    let _ = sink.send(tungstenite::Message::Close(None)).await;
}
