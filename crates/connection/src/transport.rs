//! Network I/O behind the connection driver.
//!
//! [`Transport`] is the seam between the state machine and the network:
//! health pings over HTTP and channel opens over WebSocket.
//! [`NetworkTransport`] is the production implementation.

use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use reqwest::{StatusCode, Url};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, trace};

use sessionlink_protocol::HostConfig;
use sessionlink_protocol::constants::{HTTP_STATUS_FORBIDDEN, WS_SUBPROTOCOL};

use crate::channel::{ChannelError, MessageChannel};
use crate::types::{BaseUri, ConfigError, ConnectionError};

/// Network operations needed to reach a backend session.
pub trait Transport: Send + Sync {
    /// Health-checks `base` and fetches its host configuration.
    fn ping<'a>(&'a self, base: &'a BaseUri) -> BoxFuture<'a, Result<HostConfig, ConnectionError>>;

    /// Opens the message channel at `base`, resuming `session_id` if given.
    fn open<'a>(
        &'a self,
        base: &'a BaseUri,
        session_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<MessageChannel, ChannelError>>;
}

/// HTTP (`reqwest`) and WebSocket (`tokio-tungstenite`) transport.
pub struct NetworkTransport {
    http: reqwest::Client,
    max_message_size: usize,
}

impl NetworkTransport {
    /// Creates a transport whose HTTP requests give up after `ping_timeout`.
    pub fn new(ping_timeout: Duration, max_message_size: usize) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder().timeout(ping_timeout).build()?;
        Ok(Self {
            http,
            max_message_size,
        })
    }

    /// GETs `url` and returns the body of a 200 response.
    async fn get(&self, base: &BaseUri, url: &Url) -> Result<Vec<u8>, ConnectionError> {
        let resp = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| request_error(base, &e))?;
        let status = resp.status();
        trace!(url = %url, status = status.as_u16(), "ping response");

        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), body));
        }
        Ok(resp
            .bytes()
            .await
            .map_err(|e| request_error(base, &e))?
            .to_vec())
    }

    async fn ping_inner(&self, base: &BaseUri) -> Result<HostConfig, ConnectionError> {
        let (_health, host_config) = tokio::try_join!(
            self.get(base, base.health_url()),
            self.get(base, base.host_config_url()),
        )?;
        serde_json::from_slice(&host_config)
            .map_err(|e| ConnectionError::InvalidHostConfig(e.to_string()))
    }

    async fn open_inner(
        &self,
        base: &BaseUri,
        session_id: Option<&str>,
    ) -> Result<MessageChannel, ChannelError> {
        let mut request = base.stream_url().as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, subprotocol_header(session_id)?);

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.max_message_size);
        ws_config.max_frame_size = Some(self.max_message_size);

        debug!(url = %base.stream_url(), resume = session_id.is_some(), "opening WebSocket");
        let (ws_stream, response) =
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false)
                .await
                .map_err(ChannelError::from_handshake)?;

        let accepted = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted != Some(WS_SUBPROTOCOL) {
            return Err(ChannelError::Incompatible(format!(
                "server selected subprotocol {accepted:?}, expected {WS_SUBPROTOCOL:?}"
            )));
        }

        Ok(MessageChannel::spawn(ws_stream))
    }
}

impl Transport for NetworkTransport {
    fn ping<'a>(&'a self, base: &'a BaseUri) -> BoxFuture<'a, Result<HostConfig, ConnectionError>> {
        self.ping_inner(base).boxed()
    }

    fn open<'a>(
        &'a self,
        base: &'a BaseUri,
        session_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<MessageChannel, ChannelError>> {
        self.open_inner(base, session_id).boxed()
    }
}

/// `Sec-WebSocket-Protocol` value: the protocol name, then the session to
/// resume.
pub(crate) fn subprotocol_header(session_id: Option<&str>) -> Result<HeaderValue, ChannelError> {
    let value = match session_id {
        Some(id) if id.contains(',') || id.trim().is_empty() => {
            return Err(ChannelError::InvalidSessionId);
        }
        Some(id) => format!("{WS_SUBPROTOCOL}, {id}"),
        None => WS_SUBPROTOCOL.to_string(),
    };
    HeaderValue::from_str(&value).map_err(|_| ChannelError::InvalidSessionId)
}

/// Maps a non-200 health/host-config response to its description.
pub(crate) fn status_error(status: u16, body: String) -> ConnectionError {
    if status == HTTP_STATUS_FORBIDDEN {
        ConnectionError::Cors
    } else {
        ConnectionError::HttpStatus { status, body }
    }
}

/// Maps a request that produced no response.
fn request_error(base: &BaseUri, err: &reqwest::Error) -> ConnectionError {
    debug!(uri = %base, error = %err, "ping request failed");
    if err.is_timeout() {
        ConnectionError::TimedOut
    } else if base.is_local() {
        ConnectionError::LocalServerUnreachable
    } else {
        ConnectionError::ServerUnreachable
    }
}
