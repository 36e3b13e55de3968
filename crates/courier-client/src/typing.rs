//! Remote typing indicators with a local auto-clear.
//!
//! A `typing_start` holds the indicator for `timeout`; a later `typing_start`
//! extends it, `typing_stop` or the contact going offline clears it. If the
//! stop event is lost the indicator still lapses on its own.

use std::collections::HashMap;
use std::time::Duration;

use courier_core::ContactId;
use courier_core::events::ServerEvent;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Who is typing to us right now.
#[derive(Debug)]
pub struct TypingTracker {
    timeout: Duration,
    deadlines: Mutex<HashMap<ContactId, Instant>>,
}

impl TypingTracker {
    /// Tracker whose indicators lapse after `timeout` without a refresh.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadlines: Mutex::new(HashMap::new()),
        }
    }

    /// Feed a server event. Returns whether it touched a typing indicator.
    pub fn apply(&self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::TypingStart { contact_id } => {
                self.started(contact_id);
                true
            }
            ServerEvent::TypingStop { contact_id } | ServerEvent::UserOffline { contact_id } => {
                self.stopped(contact_id)
            }
            _ => false,
        }
    }

    /// `contact` started (or is still) typing.
    pub fn started(&self, contact: &ContactId) {
        let deadline = Instant::now() + self.timeout;
        let _ = self.deadlines.lock().insert(contact.clone(), deadline);
    }

    /// `contact` stopped typing. Returns whether an indicator was showing.
    pub fn stopped(&self, contact: &ContactId) -> bool {
        self.deadlines.lock().remove(contact).is_some()
    }

    /// Whether `contact`'s indicator is showing.
    pub fn is_typing(&self, contact: &ContactId) -> bool {
        let mut deadlines = self.deadlines.lock();
        match deadlines.get(contact) {
            Some(deadline) if *deadline > Instant::now() => true,
            Some(_) => {
                let _ = deadlines.remove(contact);
                false
            }
            None => false,
        }
    }

    /// Every contact whose indicator is showing, sorted.
    pub fn typing(&self) -> Vec<ContactId> {
        let now = Instant::now();
        let mut deadlines = self.deadlines.lock();
        deadlines.retain(|_, deadline| *deadline > now);
        let mut contacts: Vec<ContactId> = deadlines.keys().cloned().collect();
        contacts.sort();
        contacts
    }

    /// Drop every indicator.
    pub fn clear(&self) {
        self.deadlines.lock().clear();
    }
}
