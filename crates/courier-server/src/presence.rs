//! Presence and typing signals.
//!
//! Fire-and-forget: nothing here is persisted, acknowledged, or retried. A
//! contact is announced online once and offline once; a disconnect only
//! turns into `user_offline` if no reconnect lands inside the grace window,
//! so bursty reconnects do not flap. Point-in-time questions ("is X online")
//! go to the Session Registry, not here.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use courier_core::ContactId;
use courier_core::events::ServerEvent;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::gateway::hub::ConnectionHub;
use crate::registry::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;

/// Broadcasts presence and routes typing indicators.
pub struct PresenceBroadcaster {
    registry: Arc<SessionRegistry>,
    hub: Arc<ConnectionHub>,
    grace: Duration,
    shutdown: ShutdownCoordinator,
    announced: Mutex<HashSet<ContactId>>,
    /// Latest presence change per contact; a grace timer only fires if it
    /// still holds the generation it was scheduled with.
    generations: DashMap<ContactId, u64>,
    next_generation: AtomicU64,
}

impl PresenceBroadcaster {
    /// Create a broadcaster with the given offline grace window. Grace
    /// timers run on `shutdown`'s tracker and stop when it is cancelled.
    pub fn new(
        registry: Arc<SessionRegistry>,
        hub: Arc<ConnectionHub>,
        grace: Duration,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            registry,
            hub,
            grace,
            shutdown,
            announced: Mutex::new(HashSet::new()),
            generations: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    fn bump(&self, contact: &ContactId) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let _ = self.generations.insert(contact.clone(), generation);
        generation
    }

    /// Announce `contact` online, cancelling any pending offline.
    pub fn set_online(&self, contact: &ContactId) {
        let _ = self.bump(contact);
        if self.announced.lock().insert(contact.clone()) {
            let delivered = self.hub.broadcast_except(
                contact,
                &ServerEvent::UserOnline {
                    contact_id: contact.clone(),
                },
            );
            debug!(contact_id = %contact, delivered, "presence online");
        }
    }

    /// Announce `contact` offline now.
    pub fn set_offline(&self, contact: &ContactId) {
        if self.announced.lock().remove(contact) {
            let delivered = self.hub.broadcast_except(
                contact,
                &ServerEvent::UserOffline {
                    contact_id: contact.clone(),
                },
            );
            debug!(contact_id = %contact, delivered, "presence offline");
        }
    }

    /// Announce `contact` offline after the grace window unless it reconnects.
    pub fn schedule_offline(self: &Arc<Self>, contact: ContactId) {
        let generation = self.bump(&contact);
        if self.grace.is_zero() {
            self.fire_offline(&contact, generation);
            return;
        }
        let this = Arc::clone(self);
        let cancel = self.shutdown.token();
        let _ = self.shutdown.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(this.grace) => this.fire_offline(&contact, generation),
                () = cancel.cancelled() => {}
            }
        });
    }

    fn fire_offline(&self, contact: &ContactId, generation: u64) {
        if self
            .generations
            .remove_if(contact, |_, current| *current == generation)
            .is_none()
        {
            return;
        }
        if self.registry.is_online(contact) {
            return;
        }
        self.set_offline(contact);
    }

    /// Tell `target` that `from` started typing.
    pub fn typing_start(&self, from: &ContactId, target: &ContactId) -> bool {
        self.route_typing(
            target,
            &ServerEvent::TypingStart {
                contact_id: from.clone(),
            },
        )
    }

    /// Tell `target` that `from` stopped typing.
    pub fn typing_stop(&self, from: &ContactId, target: &ContactId) -> bool {
        self.route_typing(
            target,
            &ServerEvent::TypingStop {
                contact_id: from.clone(),
            },
        )
    }

    fn route_typing(&self, target: &ContactId, event: &ServerEvent) -> bool {
        match self.registry.socket_for_contact(target) {
            Some(socket) => self.hub.send_to(&socket, event),
            None => false,
        }
    }

    /// Whether `contact` is currently announced online.
    pub fn is_announced(&self, contact: &ContactId) -> bool {
        self.announced.lock().contains(contact)
    }

    /// Contacts with a presence generation on record.
    pub fn tracked(&self) -> usize {
        self.generations.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
