//! Runtime configuration for the server, derived from settings.

use std::time::Duration;

use chrono::TimeDelta;
use courier_settings::CourierSettings;

use crate::delivery::DeliveryLimits;
use crate::rate_limit::RateLimitConfig;

/// Everything the server needs at runtime, with durations resolved.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` picks a free port).
    pub port: u16,
    /// Open sockets accepted before upgrades are refused.
    pub max_connections: usize,
    /// How often the server pings each socket.
    pub heartbeat_interval: Duration,
    /// Silence after which a socket is closed.
    pub heartbeat_timeout: Duration,
    /// How long a fresh socket may take to send `authenticate`.
    pub auth_timeout: Duration,
    /// Delay before a disconnect is announced as `user_offline`.
    pub presence_grace: Duration,
    /// Largest inbound WebSocket frame.
    pub max_message_size: usize,
    /// Inactivity after which a session expires.
    pub session_timeout: TimeDelta,
    /// How often expired sessions are swept.
    pub sweep_interval: Duration,
    /// Delivery limits.
    pub delivery: DeliveryLimits,
    /// Per-account request budget, if enabled.
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&CourierSettings::default())
    }
}

fn millis_delta(ms: u64) -> TimeDelta {
    i64::try_from(ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::MAX)
}

impl ServerConfig {
    /// Resolve from loaded settings.
    pub fn from_settings(settings: &CourierSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            heartbeat_interval: Duration::from_millis(server.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(server.heartbeat_timeout_ms),
            auth_timeout: Duration::from_millis(server.auth_timeout_ms),
            presence_grace: Duration::from_millis(server.presence_grace_ms),
            max_message_size: server.max_message_size,
            session_timeout: millis_delta(settings.session.timeout_ms),
            sweep_interval: Duration::from_millis(settings.session.sweep_interval_ms),
            delivery: DeliveryLimits {
                max_content_chars: settings.delivery.max_content_chars,
                default_page_limit: settings.delivery.default_page_limit,
                max_page_limit: settings.delivery.max_page_limit,
            },
            rate_limit: settings.rate_limit.enabled.then(|| RateLimitConfig {
                capacity: settings.rate_limit.requests_per_window,
                window: Duration::from_millis(settings.rate_limit.window_ms),
            }),
        }
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
