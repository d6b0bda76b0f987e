use std::net::SocketAddr;
use std::time::Duration;

/// Broker API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP listener binds to.
    pub bind_addr: SocketAddr,
    /// Path of the WebSocket accept endpoint.
    pub ws_path: String,
    /// Whether the session id comes from a header (`true`) or a query parameter.
    pub session_id_from_header: bool,
    /// Header name or query key carrying the session id.
    pub session_id_key: String,
    /// Redis connection URL for the external bus.
    pub redis_url: String,
    /// Write deadline applied to every outbound WebSocket write.
    pub write_wait: Duration,
    /// Read deadline; refreshed by any inbound frame (pong included).
    pub pong_wait: Duration,
    /// Keepalive probe period, always derived as 9/10 of `pong_wait`.
    pub ping_period: Duration,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Whether a membership update with an empty group list ends the session
    /// (full teardown) or only detaches it from all groups.
    pub end_session_on_empty_update: bool,
    /// Bus channel names, derived from a single configurable prefix.
    pub channels: BusChannels,
}

/// Channel names on the external bus, one per logical feed.
#[derive(Debug, Clone)]
pub struct BusChannels {
    /// New-session announcements (session id payload).
    pub new_client: String,
    /// Prefix for raw client data; the session id is appended.
    pub data_from_client: String,
    /// Prefix for membership updates; pattern-subscribed with `*`.
    pub new_groups: String,
    /// Prefix for group broadcasts; pattern-subscribed with `*`.
    pub data_to_group: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a variable is present but malformed.
    pub fn from_env() -> Self {
        let pong_wait = Duration::from_secs(parsed_var("PONG_WAIT_SECS", 60));
        let prefix = var_or("CHANNEL_PREFIX", "groupcast:");

        Self {
            bind_addr: var_or("BIND_ADDR", "0.0.0.0:8080")
                .parse()
                .expect("BIND_ADDR must be a socket address"),
            ws_path: var_or("WS_PATH", "/ws"),
            session_id_from_header: parsed_var("SESSION_ID_FROM_HEADER", false),
            session_id_key: var_or("SESSION_ID_KEY", "session"),
            redis_url: var_or("REDIS_URL", "redis://127.0.0.1:6379"),
            write_wait: Duration::from_secs(parsed_var("WRITE_WAIT_SECS", 10)),
            pong_wait,
            ping_period: ping_period(pong_wait),
            max_message_size: parsed_var("MAX_MESSAGE_SIZE", 65536),
            end_session_on_empty_update: parsed_var("END_SESSION_ON_EMPTY_UPDATE", true),
            channels: BusChannels::with_prefix(&prefix),
        }
    }
}

impl BusChannels {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            new_client: format!("{prefix}client-new"),
            data_from_client: format!("{prefix}client-data:"),
            new_groups: format!("{prefix}groups-new:"),
            data_to_group: format!("{prefix}group-data:"),
        }
    }
}

/// Keepalive period: probes must land comfortably before the peer's read
/// deadline, so the period is 9/10 of the pong-wait window.
pub fn ping_period(pong_wait: Duration) -> Duration {
    pong_wait * 9 / 10
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .unwrap_or_else(|_| panic!("{name} env var is malformed")),
        _ => default,
    }
}
