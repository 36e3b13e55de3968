//! Periodic expiry of idle sessions.

use std::sync::Arc;
use std::time::Duration;

use courier_core::events::{ServerEvent, reasons};
use metrics::{counter, gauge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::gateway::hub::ConnectionHub;
use crate::metrics::{SESSIONS_ACTIVE, SESSIONS_EXPIRED_TOTAL};
use crate::presence::PresenceBroadcaster;
use crate::rate_limit::RateLimiter;
use crate::registry::SessionRegistry;

/// What the sweeper touches.
#[derive(Clone)]
pub struct Sweeper {
    registry: Arc<SessionRegistry>,
    hub: Arc<ConnectionHub>,
    presence: Arc<PresenceBroadcaster>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl Sweeper {
    /// Create a sweeper.
    pub fn new(
        registry: Arc<SessionRegistry>,
        hub: Arc<ConnectionHub>,
        presence: Arc<PresenceBroadcaster>,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Self {
        Self {
            registry,
            hub,
            presence,
            rate_limiter,
        }
    }

    /// Expire idle sessions once, closing their sockets.
    ///
    /// Returns how many sessions expired.
    pub fn sweep_once(&self) -> usize {
        let expired = self.registry.sweep_expired();
        for session in &expired {
            if let Some(socket) = &session.socket_id {
                let _ = self.hub.close(
                    socket,
                    &ServerEvent::SessionInvalidated {
                        reason: reasons::EXPIRED.into(),
                    },
                );
            }
            self.presence.schedule_offline(session.contact_id.clone());
            info!(account_id = %session.account_id, contact_id = %session.contact_id, "session expired");
        }
        if let Some(limiter) = &self.rate_limiter {
            limiter.prune();
        }
        counter!(SESSIONS_EXPIRED_TOTAL).increment(expired.len() as u64);
        #[allow(clippy::cast_precision_loss)]
        gauge!(SESSIONS_ACTIVE).set(self.registry.active_count() as f64);
        expired.len()
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.sweep_once();
                    if expired > 0 {
                        debug!(expired, "session sweep");
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
        debug!("session sweeper stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
