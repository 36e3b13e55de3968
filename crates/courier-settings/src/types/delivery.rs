//! Delivery pipeline settings.

use serde::{Deserialize, Serialize};

/// Delivery pipeline policy, shared by server and client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    /// Upper bound on message length, in characters.
    pub max_content_chars: usize,
    /// Client-side deadline for a send round-trip.
    pub send_timeout_ms: u64,
    /// `createdAt` tolerance for client-id dedup matches.
    pub dedup_tolerance_ms: u64,
    /// Page size when `limit` is omitted.
    pub default_page_limit: usize,
    /// Largest page a caller may request.
    pub max_page_limit: usize,
    /// Recipient clients acknowledge `delivered` on receipt automatically.
    pub auto_ack_delivered: bool,
    /// Seal message bodies with the configured encryptor.
    pub encryption_enabled: bool,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_content_chars: 4_000,
            send_timeout_ms: 15_000,
            dedup_tolerance_ms: 120_000,
            default_page_limit: 50,
            max_page_limit: 200,
            auto_ack_delivered: true,
            encryption_enabled: false,
        }
    }
}
