//! Client gateway, poller, and cache settings.

use serde::{Deserialize, Serialize};

/// Client connection and sync settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Base URL of the courier server (`http(s)://host:port`).
    pub server_url: String,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay_ms: u64,
    /// Attempts before the gateway gives up.
    pub reconnect_max_attempts: u32,
    /// Interval between application-level pings once active.
    pub ping_interval_ms: u64,
    /// Deadline for the matching pong.
    pub pong_timeout_ms: u64,
    /// Outbound queue bound while disconnected; `0` is unbounded.
    pub outbound_queue_limit: usize,
    /// Interval between conversation polls.
    pub poll_interval_ms: u64,
    /// Inactivity after which a remote typing indicator auto-clears.
    pub typing_timeout_ms: u64,
    /// Deadline for opening the transport.
    pub connect_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            reconnect_base_delay_ms: 1_000,
            reconnect_max_attempts: 10,
            ping_interval_ms: 25_000,
            pong_timeout_ms: 10_000,
            outbound_queue_limit: 512,
            poll_interval_ms: 15_000,
            typing_timeout_ms: 2_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Client cache sizing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Cache database path.
    pub path: String,
    /// Message count per chat that triggers eviction.
    pub high_water: usize,
    /// Message count per chat after eviction.
    pub low_water: usize,
    /// Lifetime of non-message cache entries.
    pub ttl_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            path: "cache.db".to_string(),
            high_water: 1_000,
            low_water: 500,
            ttl_ms: 300_000,
        }
    }
}
