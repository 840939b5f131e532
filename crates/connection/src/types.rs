//! Public types for the connection manager.

use std::fmt;
use std::time::Duration;

use reqwest::Url;

use sessionlink_protocol::constants::{
    CONNECT_TIMEOUT, CORS_DOCUMENTATION_URL, HEALTH_CHECK_PATH, HOST_CONFIG_PATH, LOCAL_HOSTS,
    MAX_RETRY_PERIOD, MIN_RETRY_PERIOD, PING_TIMEOUT, RETRY_BACKOFF_FACTOR, STREAM_PATH,
    WS_MAX_MESSAGE_SIZE,
};
use sessionlink_protocol::{ConnectionState, HostConfig};

/// Errors raised while building a connection configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one candidate base URI is required")]
    NoCandidates,

    #[error("invalid base URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("unsupported scheme {scheme:?} in {uri:?} (expected http or https)")]
    UnsupportedScheme { uri: String, scheme: String },

    #[error("invalid retry settings: {0}")]
    InvalidRetry(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Renderable description of a recoverable connection failure.
///
/// The `Display` output is meant to be shown to users as-is.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    #[error(
        "Cannot connect to the server (HTTP status: 403). If you are trying to access an app \
         running on another server, this could be due to the app's CORS settings. See {url}",
        url = CORS_DOCUMENTATION_URL
    )]
    Cors,

    #[error(
        "Is the server still running? If you accidentally stopped it, restart it and this \
         client will reconnect."
    )]
    LocalServerUnreachable,

    #[error("Server is not responding. Are you connected to the internet?")]
    ServerUnreachable,

    #[error("Connection failed with status {status}, and response \"{body}\".")]
    HttpStatus { status: u16, body: String },

    #[error("Connection timed out.")]
    TimedOut,

    #[error("Invalid host configuration: {0}")]
    InvalidHostConfig(String),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Connection error: {0}")]
    Channel(String),
}

/// A validated candidate base URI with its derived endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUri {
    base: Url,
    health: Url,
    host_config: Url,
    stream: Url,
}

impl BaseUri {
    /// Parses an `http`/`https` base URI. A trailing slash is added so the
    /// endpoint paths join underneath any path prefix.
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUri {
            uri: uri.to_string(),
            reason,
        };

        let mut base = Url::parse(uri).map_err(|e| invalid(e.to_string()))?;
        let ws_scheme = match base.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(ConfigError::UnsupportedScheme {
                    uri: uri.to_string(),
                    scheme: other.to_string(),
                });
            }
        };
        base.set_query(None);
        base.set_fragment(None);
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let join = |path: &str| base.join(path).map_err(|e| invalid(e.to_string()));
        let health = join(HEALTH_CHECK_PATH)?;
        let host_config = join(HOST_CONFIG_PATH)?;
        let mut stream = join(STREAM_PATH)?;
        stream
            .set_scheme(ws_scheme)
            .map_err(|()| invalid(format!("cannot switch scheme to {ws_scheme}")))?;

        Ok(Self {
            base,
            health,
            host_config,
            stream,
        })
    }

    pub fn as_str(&self) -> &str {
        self.base.as_str()
    }

    pub fn health_url(&self) -> &Url {
        &self.health
    }

    pub fn host_config_url(&self) -> &Url {
        &self.host_config
    }

    /// WebSocket URL of the message channel (`ws://` or `wss://`).
    pub fn stream_url(&self) -> &Url {
        &self.stream
    }

    /// Returns true if the URI points at this machine.
    pub fn is_local(&self) -> bool {
        self.base
            .host_str()
            .is_some_and(|host| LOCAL_HOSTS.iter().any(|h| h.eq_ignore_ascii_case(host)))
    }
}

impl fmt::Display for BaseUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base.as_str())
    }
}

/// Configuration for retries with bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay after the first failure of a streak.
    pub min_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Multiplier for each subsequent failure.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: MIN_RETRY_PERIOD,
            max_delay: MAX_RETRY_PERIOD,
            backoff_factor: RETRY_BACKOFF_FACTOR,
        }
    }
}

impl RetryConfig {
    /// Delay for the n-th consecutive failure (1-based), clamped to
    /// `[min_delay, max_delay]`. Non-decreasing in `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(1023) as i32;
        let secs = self.min_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        // 0 * inf is NaN; an unrepresentable product saturates at the cap.
        let delay = if secs.is_nan() {
            self.min_delay
        } else {
            Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
        };
        delay.min(self.max_delay).max(self.min_delay)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_delay.is_zero() {
            return Err(ConfigError::InvalidRetry(
                "min delay must be greater than zero".into(),
            ));
        }
        if self.min_delay > self.max_delay {
            return Err(ConfigError::InvalidRetry(format!(
                "min delay {:?} exceeds max delay {:?}",
                self.min_delay, self.max_delay
            )));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::InvalidRetry(format!(
                "backoff factor must be a finite number >= 1, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }
}

/// Everything a connection manager needs to reach a backend session.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Candidate base URIs, probed round-robin. Never empty.
    pub base_uris: Vec<BaseUri>,
    pub retry: RetryConfig,
    pub connect_timeout: Duration,
    pub ping_timeout: Duration,
    pub max_message_size: usize,
    /// Session to resume on the first connection.
    pub session_id: Option<String>,
}

impl ConnectionConfig {
    /// Builds a configuration with default timings for the given candidates.
    pub fn new<I, S>(uris: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let base_uris = uris
            .into_iter()
            .map(|u| BaseUri::parse(u.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let config = Self {
            base_uris,
            retry: RetryConfig::default(),
            connect_timeout: CONNECT_TIMEOUT,
            ping_timeout: PING_TIMEOUT,
            max_message_size: WS_MAX_MESSAGE_SIZE,
            session_id: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_uris.is_empty() {
            return Err(ConfigError::NoCandidates);
        }
        self.retry.validate()
    }
}

/// An opaque payload received on the message channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Position of the message on its channel, starting at zero for every
    /// newly opened channel.
    pub seq: u64,
    pub data: Vec<u8>,
}

/// Notifications emitted by the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection state changed. `error` is set when the change was
    /// caused by a failure.
    StateChanged {
        state: ConnectionState,
        error: Option<String>,
    },
    /// A payload arrived on the open channel.
    Message(InboundMessage),
    /// A retry is scheduled after `delay`.
    Retry {
        total_tries: u32,
        error: ConnectionError,
        delay: Duration,
    },
    /// A health check succeeded and the host configuration was fetched.
    HostConfig(HostConfig),
}
