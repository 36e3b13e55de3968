//! Settings type definitions.

mod client;
mod delivery;
mod server;

pub use client::{CacheSettings, ClientSettings};
pub use delivery::DeliverySettings;
pub use server::{LoggingSettings, RateLimitSettings, ServerSettings, SessionSettings};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierSettings {
    /// Network listener and gateway settings.
    pub server: ServerSettings,
    /// Session Registry policy.
    pub session: SessionSettings,
    /// Delivery pipeline policy.
    pub delivery: DeliverySettings,
    /// Per-account request throttling.
    pub rate_limit: RateLimitSettings,
    /// Client gateway and poller settings.
    pub client: ClientSettings,
    /// Client cache sizing.
    pub cache: CacheSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl CourierSettings {
    /// Check cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.cache.low_water > self.cache.high_water {
            return Err(SettingsError::InvalidValue(format!(
                "cache.lowWater ({}) exceeds cache.highWater ({})",
                self.cache.low_water, self.cache.high_water
            )));
        }
        if self.client.pong_timeout_ms >= self.client.ping_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "client.pongTimeoutMs ({}) must be shorter than client.pingIntervalMs ({})",
                self.client.pong_timeout_ms, self.client.ping_interval_ms
            )));
        }
        if self.delivery.default_page_limit > self.delivery.max_page_limit {
            return Err(SettingsError::InvalidValue(format!(
                "delivery.defaultPageLimit ({}) exceeds delivery.maxPageLimit ({})",
                self.delivery.default_page_limit, self.delivery.max_page_limit
            )));
        }
        if self.server.heartbeat_timeout_ms < self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatTimeoutMs is shorter than server.heartbeatIntervalMs".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        CourierSettings::default().validate().unwrap();
    }

    #[test]
    fn inverted_water_marks_rejected() {
        let mut s = CourierSettings::default();
        s.cache.low_water = 2_000;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn pong_timeout_must_be_shorter_than_ping_interval() {
        let mut s = CourierSettings::default();
        s.client.pong_timeout_ms = s.client.ping_interval_ms;
        assert!(s.validate().is_err());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(CourierSettings::default()).unwrap();
        assert!(json["server"]["presenceGraceMs"].is_number());
        assert!(json["rateLimit"]["requestsPerWindow"].is_number());
        assert!(json["client"]["outboundQueueLimit"].is_number());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: CourierSettings =
            serde_json::from_str(r#"{"cache": {"highWater": 50}}"#).unwrap();
        assert_eq!(s.cache.high_water, 50);
        assert_eq!(s.cache.low_water, 500);
        assert_eq!(s.server.port, 8080);
    }
}
