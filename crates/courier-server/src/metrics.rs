//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Fails if a recorder is already installed in this process.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Sessions created total (counter).
pub const SESSIONS_CREATED_TOTAL: &str = "courier_sessions_created_total";
/// Sessions superseded by a newer login (counter).
pub const SESSIONS_SUPERSEDED_TOTAL: &str = "courier_sessions_superseded_total";
/// Sessions expired by the sweeper (counter).
pub const SESSIONS_EXPIRED_TOTAL: &str = "courier_sessions_expired_total";
/// Active sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "courier_sessions_active";
/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "courier_ws_connections_total";
/// WebSocket disconnections total (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "courier_ws_disconnections_total";
/// Open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "courier_ws_connections_active";
/// Frames dropped because a socket was gone or full (counter).
pub const WS_DROPPED_FRAMES_TOTAL: &str = "courier_ws_dropped_frames_total";
/// Socket authentication failures (counter).
pub const WS_AUTH_FAILURES_TOTAL: &str = "courier_ws_auth_failures_total";
/// Messages persisted (counter).
pub const MESSAGES_SENT_TOTAL: &str = "courier_messages_sent_total";
/// Messages pushed to a live recipient (counter).
pub const MESSAGES_PUSHED_TOTAL: &str = "courier_messages_pushed_total";
/// Receipts that advanced a message (counter, labels: status).
pub const RECEIPTS_TOTAL: &str = "courier_receipts_total";
/// Requests rejected by the rate limiter (counter).
pub const RATE_LIMITED_TOTAL: &str = "courier_rate_limited_total";
