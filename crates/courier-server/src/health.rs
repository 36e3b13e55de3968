//! Liveness report served at `/health`.

use std::time::Duration;

use serde::Serialize;

use crate::server::AppState;

/// Whether the server is taking new work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Serving normally.
    Ok,
    /// Shutdown has begun; existing sockets are being drained.
    Draining,
}

/// Session counters from the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SessionCounts {
    /// Logged-in accounts.
    pub active: usize,
    /// Of those, the ones with a bound socket.
    pub connected: usize,
}

/// `/health` body.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Serving or draining.
    pub status: HealthStatus,
    /// Seconds since start.
    pub uptime_secs: u64,
    /// Open sockets, authenticated or not.
    pub connections: usize,
    /// Registry counters.
    pub sessions: SessionCounts,
}

impl HealthReport {
    /// Snapshot the live counters in `state`.
    pub fn capture(state: &AppState) -> Self {
        let status = if state.shutdown.is_shutting_down() {
            HealthStatus::Draining
        } else {
            HealthStatus::Ok
        };
        Self::from_parts(
            status,
            state.start_time.elapsed(),
            state.hub.connection_count(),
            SessionCounts {
                active: state.registry.active_count(),
                connected: state.registry.connected_count(),
            },
        )
    }

    fn from_parts(
        status: HealthStatus,
        uptime: Duration,
        connections: usize,
        sessions: SessionCounts,
    ) -> Self {
        Self {
            status,
            uptime_secs: uptime.as_secs(),
            connections,
            sessions,
        }
    }
}
