//! Server-side liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use super::connection::ClientConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The client went silent for the whole timeout window.
    TimedOut,
    /// The socket closed for another reason.
    Cancelled,
}

/// Watch a connection's activity until it goes silent or closes.
///
/// Every `interval` the alive flag is checked and reset. Each tick on which
/// the client showed activity calls `on_alive` (used to refresh the session's
/// activity timestamp). After `timeout / interval` consecutive silent ticks
/// (at least one) the connection is declared dead.
pub async fn run_heartbeat<F>(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
    on_alive: F,
) -> HeartbeatOutcome
where
    F: Fn(),
{
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let interval_ms = interval.as_millis().max(1);
    let max_missed = u32::try_from((timeout.as_millis() / interval_ms).max(1)).unwrap_or(u32::MAX);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if connection.check_alive() {
                    missed = 0;
                    on_alive();
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatOutcome::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => return HeartbeatOutcome::Cancelled,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
