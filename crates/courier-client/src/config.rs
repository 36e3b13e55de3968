//! Runtime configuration for the client, derived from settings.

use std::time::Duration;

use chrono::TimeDelta;
use courier_core::dedup::DedupPolicy;
use courier_settings::CourierSettings;

use crate::gateway::machine::BackoffPolicy;

/// Everything the client needs at runtime, with durations resolved.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base HTTP URL of the server (`http://host:port`).
    pub server_url: String,
    /// Reconnect schedule.
    pub backoff: BackoffPolicy,
    /// How often the client pings an active socket.
    pub ping_interval: Duration,
    /// How long a ping may go unanswered.
    pub pong_timeout: Duration,
    /// Outbound events kept while not `Active` (`0` = unbounded).
    pub outbound_queue_limit: usize,
    /// Interval of the redundant polling path.
    pub poll_interval: Duration,
    /// Local auto-clear for typing indicators.
    pub typing_timeout: Duration,
    /// Time allowed to open a socket.
    pub connect_timeout: Duration,
    /// Time allowed for one HTTP request.
    pub request_timeout: Duration,
    /// Upper bound on message length, in characters.
    pub max_content_chars: usize,
    /// Whether incoming pushes are acknowledged as delivered.
    pub auto_ack_delivered: bool,
    /// Whether message bodies go through the configured encryptor.
    pub encryption_enabled: bool,
    /// Duplicate detection for the reconciliation merge.
    pub dedup: DedupPolicy,
    /// Cache database path.
    pub cache_path: String,
    /// Per-chat message count that triggers eviction.
    pub high_water: usize,
    /// Per-chat message count eviction trims down to.
    pub low_water: usize,
    /// Freshness window of `cache:` entries.
    pub cache_ttl: TimeDelta,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_settings(&CourierSettings::default())
    }
}

impl ClientConfig {
    /// Resolve from loaded settings.
    pub fn from_settings(settings: &CourierSettings) -> Self {
        let client = &settings.client;
        Self {
            server_url: client.server_url.trim_end_matches('/').to_owned(),
            backoff: BackoffPolicy {
                base: Duration::from_millis(client.reconnect_base_delay_ms),
                max_attempts: client.reconnect_max_attempts,
            },
            ping_interval: Duration::from_millis(client.ping_interval_ms),
            pong_timeout: Duration::from_millis(client.pong_timeout_ms),
            outbound_queue_limit: client.outbound_queue_limit,
            poll_interval: Duration::from_millis(client.poll_interval_ms),
            typing_timeout: Duration::from_millis(client.typing_timeout_ms),
            connect_timeout: Duration::from_millis(client.connect_timeout_ms),
            request_timeout: Duration::from_millis(settings.delivery.send_timeout_ms),
            max_content_chars: settings.delivery.max_content_chars,
            auto_ack_delivered: settings.delivery.auto_ack_delivered,
            encryption_enabled: settings.delivery.encryption_enabled,
            dedup: DedupPolicy::from_millis(settings.delivery.dedup_tolerance_ms),
            cache_path: settings.cache.path.clone(),
            high_water: settings.cache.high_water,
            low_water: settings.cache.low_water,
            cache_ttl: i64::try_from(settings.cache.ttl_ms)
                .ok()
                .and_then(TimeDelta::try_milliseconds)
                .unwrap_or(TimeDelta::MAX),
        }
    }

    /// WebSocket URL derived from the HTTP base.
    pub fn ws_url(&self) -> String {
        let base = &self.server_url;
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.clone()
        };
        format!("{ws}/ws")
    }
}
