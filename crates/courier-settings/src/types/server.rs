//! Server, session, rate limit, and logging settings.

use serde::{Deserialize, Serialize};

/// Network listener and gateway settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP/WebSocket port.
    pub port: u16,
    /// Maximum concurrent sockets.
    pub max_connections: usize,
    /// Interval between server-initiated WebSocket pings.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a socket is considered dead.
    pub heartbeat_timeout_ms: u64,
    /// Time a new socket has to send `authenticate`.
    pub auth_timeout_ms: u64,
    /// Delay before broadcasting `user_offline` after a disconnect.
    pub presence_grace_ms: u64,
    /// Largest accepted WebSocket frame, in bytes.
    pub max_message_size: usize,
    /// Authoritative message store path.
    pub database_path: String,
    /// HS256 secret for identity tokens. Usually supplied via env.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_secret: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            auth_timeout_ms: 10_000,
            presence_grace_ms: 5_000,
            max_message_size: 65_536,
            database_path: "courier.db".to_string(),
            identity_secret: None,
        }
    }
}

/// Session Registry policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Inactivity after which a session is swept.
    pub timeout_ms: u64,
    /// How often the sweep runs.
    pub sweep_interval_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 86_400_000,
            sweep_interval_ms: 60_000,
        }
    }
}

/// Per-account request throttling.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    /// Whether throttling is applied at all.
    pub enabled: bool,
    /// Requests allowed per window.
    pub requests_per_window: u32,
    /// Window length.
    pub window_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_window: 120,
            window_ms: 60_000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
