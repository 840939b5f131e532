use std::time::Duration;

/// Health-check endpoint, relative to a candidate base URI.
pub const HEALTH_CHECK_PATH: &str = "_stcore/health";

/// Host configuration endpoint, relative to a candidate base URI.
pub const HOST_CONFIG_PATH: &str = "_stcore/host-config";

/// Streaming endpoint upgraded to a WebSocket.
pub const STREAM_PATH: &str = "_stcore/stream";

/// First `Sec-WebSocket-Protocol` value. The server must echo it back;
/// a handshake without it is a protocol incompatibility.
pub const WS_SUBPROTOCOL: &str = "streamlit";

/// Shortest delay between two connection attempts.
pub const MIN_RETRY_PERIOD: Duration = Duration::from_millis(500);

/// Longest delay between two connection attempts (backoff cap).
pub const MAX_RETRY_PERIOD: Duration = Duration::from_millis(60_000);

/// Time allowed for the WebSocket handshake to complete.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Time allowed for a health-check (and host-config) request.
pub const PING_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Multiplier applied to the retry delay after each consecutive failure.
pub const RETRY_BACKOFF_FACTOR: f64 = 2.0;

/// How often the client sends keepalive pings on an open channel.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// Read deadline on an open channel.
///
/// Any incoming frame (not only pongs) pushes the deadline back. If nothing
/// arrives within this window the channel is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// Maximum inbound message size in bytes (200 MiB, the server default).
pub const WS_MAX_MESSAGE_SIZE: usize = 200 * 1024 * 1024;

/// Where users are sent when a health check is rejected with HTTP 403.
pub const CORS_DOCUMENTATION_URL: &str =
    "https://docs.streamlit.io/develop/api-reference/configuration/config.toml#server.enableCORS";

/// HTTP status that signals a cross-origin misconfiguration on health checks.
pub const HTTP_STATUS_FORBIDDEN: u16 = 403;

/// Host names treated as "this machine" when wording unreachable-server
/// messages.
pub const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "[::1]", "::1"];
