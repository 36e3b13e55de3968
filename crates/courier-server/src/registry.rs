//! Session Registry: the one active login per account.
//!
//! All state lives behind a single lock so that session replacement, socket
//! binding and the expiry sweep are atomic with respect to each other. A
//! socket is attached only after its token is re-checked under the same
//! write lock, so a login that lands between `validate` and `attach_socket`
//! cannot be overwritten by the older device.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeDelta, Utc};
use courier_core::clock::SharedClock;
use courier_core::{AccountId, ContactId, CourierError, DeviceId, Result, SocketId};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// One account's active login.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    /// Identity-provider subject.
    pub account_id: AccountId,
    /// Contact handle the session speaks for.
    pub contact_id: ContactId,
    /// Device the login came from.
    pub device_id: DeviceId,
    /// Live socket, if connected.
    pub socket_id: Option<SocketId>,
    /// When the login happened.
    pub created_at: DateTime<Utc>,
    /// Last authenticated request or heartbeat.
    pub last_activity_at: DateTime<Utc>,
    token_digest: String,
}

impl Session {
    /// Whether `token` is this session's credential.
    pub fn matches_token(&self, token: &str) -> bool {
        self.token_digest == digest(token)
    }
}

/// Outcome of [`SessionRegistry::create_session`].
#[derive(Clone, Debug)]
pub struct SessionCreated {
    /// The new session.
    pub session: Session,
    /// The session it replaced, whose socket must be invalidated.
    pub superseded: Option<Session>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<AccountId, Session>,
    sockets: HashMap<SocketId, AccountId>,
    contacts: HashMap<ContactId, AccountId>,
}

impl Inner {
    fn unindex(&mut self, session: &Session) {
        if let Some(socket) = &session.socket_id {
            let _ = self.sockets.remove(socket);
        }
        if self.contacts.get(&session.contact_id) == Some(&session.account_id) {
            let _ = self.contacts.remove(&session.contact_id);
        }
    }
}

/// Authoritative in-memory record of active sessions.
pub struct SessionRegistry {
    inner: RwLock<Inner>,
    clock: SharedClock,
    timeout: TimeDelta,
}

impl SessionRegistry {
    /// Create a registry that expires sessions idle for longer than `timeout`.
    pub fn new(clock: SharedClock, timeout: TimeDelta) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
            timeout,
        }
    }

    /// Record a fresh login, replacing any existing session for the account.
    ///
    /// Never fails. The replaced session, if any, is returned so the caller
    /// can notify and close its socket.
    pub fn create_session(
        &self,
        account_id: AccountId,
        token: &str,
        contact_id: ContactId,
        device_id: DeviceId,
    ) -> SessionCreated {
        let now = self.clock.now();
        let session = Session {
            account_id: account_id.clone(),
            contact_id: contact_id.clone(),
            device_id,
            socket_id: None,
            created_at: now,
            last_activity_at: now,
            token_digest: digest(token),
        };

        let mut inner = self.inner.write();
        let superseded = inner.sessions.remove(&account_id);
        if let Some(old) = &superseded {
            inner.unindex(old);
        }
        let _ = inner.contacts.insert(contact_id, account_id.clone());
        let _ = inner.sessions.insert(account_id.clone(), session.clone());
        drop(inner);

        info!(
            account_id = %account_id,
            contact_id = %session.contact_id,
            device_id = %session.device_id,
            superseded = superseded.is_some(),
            "session created"
        );
        SessionCreated {
            session,
            superseded,
        }
    }

    /// Check that `token` is the current credential for `account_id`.
    ///
    /// A missing session and a mismatched token are the same rejection.
    pub fn validate(&self, account_id: &AccountId, token: &str) -> Result<Session> {
        let inner = self.inner.read();
        match inner.sessions.get(account_id) {
            Some(session) if session.matches_token(token) => Ok(session.clone()),
            _ => Err(CourierError::auth_invalid("not the active session")),
        }
    }

    /// Record activity for `account_id`. Returns `false` if no session exists.
    pub fn touch(&self, account_id: &AccountId) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        match inner.sessions.get_mut(account_id) {
            Some(session) => {
                if now > session.last_activity_at {
                    session.last_activity_at = now;
                }
                true
            }
            None => false,
        }
    }

    /// Remove the session for `account_id` (logout).
    pub fn destroy(&self, account_id: &AccountId) -> Option<Session> {
        let mut inner = self.inner.write();
        let removed = inner.sessions.remove(account_id);
        if let Some(session) = &removed {
            inner.unindex(session);
            debug!(account_id = %account_id, "session destroyed");
        }
        removed
    }

    /// Remove every session idle past the timeout, returning them.
    ///
    /// The cutoff is computed under the write lock, so a concurrent `touch`
    /// either lands first (and keeps the session) or after removal.
    pub fn sweep_expired(&self) -> Vec<Session> {
        let mut inner = self.inner.write();
        let now = self.clock.now();
        let expired: Vec<AccountId> = inner
            .sessions
            .values()
            .filter(|s| now - s.last_activity_at > self.timeout)
            .map(|s| s.account_id.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for account_id in expired {
            if let Some(session) = inner.sessions.remove(&account_id) {
                inner.unindex(&session);
                removed.push(session);
            }
        }
        removed
    }

    /// Bind `socket_id` to the session, re-checking `token` atomically.
    ///
    /// Returns the previously bound socket, which the caller must close.
    pub fn attach_socket(
        &self,
        account_id: &AccountId,
        token: &str,
        socket_id: SocketId,
    ) -> Result<Option<SocketId>> {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        let session = match inner.sessions.get_mut(account_id) {
            Some(s) if s.matches_token(token) => s,
            _ => return Err(CourierError::auth_invalid("not the active session")),
        };
        let previous = session.socket_id.replace(socket_id.clone());
        session.last_activity_at = session.last_activity_at.max(now);
        if let Some(prev) = &previous {
            let _ = inner.sockets.remove(prev);
        }
        let _ = inner.sockets.insert(socket_id, account_id.clone());
        Ok(previous.filter(|p| inner.sockets.get(p).is_none()))
    }

    /// Clear the socket binding if `socket_id` is still the bound one.
    ///
    /// Returns `true` if the binding was cleared. A replaced socket that
    /// disconnects late does not clear its successor.
    pub fn detach_socket(&self, account_id: &AccountId, socket_id: &SocketId) -> bool {
        let mut inner = self.inner.write();
        let Some(session) = inner.sessions.get_mut(account_id) else {
            return false;
        };
        if session.socket_id.as_ref() != Some(socket_id) {
            return false;
        }
        session.socket_id = None;
        let _ = inner.sockets.remove(socket_id);
        true
    }

    /// Whether `contact_id` currently has a live connection.
    pub fn is_online(&self, contact_id: &ContactId) -> bool {
        self.socket_for_contact(contact_id).is_some()
    }

    /// Live socket of `contact_id`, if any.
    pub fn socket_for_contact(&self, contact_id: &ContactId) -> Option<SocketId> {
        let inner = self.inner.read();
        let account = inner.contacts.get(contact_id)?;
        inner.sessions.get(account)?.socket_id.clone()
    }

    /// Account that owns `socket_id`, if bound.
    pub fn account_for_socket(&self, socket_id: &SocketId) -> Option<AccountId> {
        self.inner.read().sockets.get(socket_id).cloned()
    }

    /// Snapshot of the session for `account_id`.
    pub fn session(&self, account_id: &AccountId) -> Option<Session> {
        self.inner.read().sessions.get(account_id).cloned()
    }

    /// Number of active sessions.
    pub fn active_count(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Number of sessions with a live socket.
    pub fn connected_count(&self) -> usize {
        self.inner.read().sockets.len()
    }
}

fn digest(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use courier_core::ManualClock;
    use std::sync::Arc;

    fn registry() -> (SessionRegistry, ManualClock) {
        let clock = ManualClock::default();
        let reg = SessionRegistry::new(Arc::new(clock.clone()), TimeDelta::hours(24));
        (reg, clock)
    }

    fn login(reg: &SessionRegistry, account: &str, token: &str, contact: &str) -> SessionCreated {
        reg.create_session(account.into(), token, contact.into(), "d1".into())
    }

    #[test]
    fn create_then_validate() {
        let (reg, _) = registry();
        let created = login(&reg, "u1", "t1", "alice");
        assert!(created.superseded.is_none());
        let session = reg.validate(&"u1".into(), "t1").unwrap();
        assert_eq!(session.contact_id.as_str(), "alice");
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn second_login_invalidates_first_token() {
        let (reg, _) = registry();
        let _ = login(&reg, "u1", "t1", "alice");
        let created = reg.create_session("u1".into(), "t2", "alice".into(), "d2".into());
        assert_eq!(created.superseded.unwrap().device_id.as_str(), "d1");
        assert_matches!(reg.validate(&"u1".into(), "t1"), Err(CourierError::AuthInvalid(_)));
        assert!(reg.validate(&"u1".into(), "t2").is_ok());
        assert_eq!(reg.active_count(), 1);
    }

    #[test]
    fn unknown_account_and_wrong_token_are_the_same_rejection() {
        let (reg, _) = registry();
        let _ = login(&reg, "u1", "t1", "alice");
        let a = reg.validate(&"nobody".into(), "t1").unwrap_err();
        let b = reg.validate(&"u1".into(), "wrong").unwrap_err();
        assert_eq!(a, b);
    }

    #[test]
    fn touch_moves_last_activity() {
        let (reg, clock) = registry();
        let _ = login(&reg, "u1", "t1", "alice");
        clock.advance(TimeDelta::minutes(5));
        assert!(reg.touch(&"u1".into()));
        let s = reg.session(&"u1".into()).unwrap();
        assert_eq!(s.last_activity_at - s.created_at, TimeDelta::minutes(5));
        assert!(!reg.touch(&"ghost".into()));
    }

    #[test]
    fn destroy_removes_session_and_indexes() {
        let (reg, _) = registry();
        let _ = login(&reg, "u1", "t1", "alice");
        let _ = reg.attach_socket(&"u1".into(), "t1", "s1".into()).unwrap();
        assert!(reg.destroy(&"u1".into()).is_some());
        assert!(reg.validate(&"u1".into(), "t1").is_err());
        assert!(!reg.is_online(&"alice".into()));
        assert!(reg.account_for_socket(&"s1".into()).is_none());
        assert!(reg.destroy(&"u1".into()).is_none());
    }

    #[test]
    fn sweep_removes_only_idle_sessions() {
        let (reg, clock) = registry();
        let _ = login(&reg, "idle", "t1", "a");
        clock.advance(TimeDelta::hours(20));
        let _ = login(&reg, "busy", "t2", "b");
        clock.advance(TimeDelta::hours(5));
        let removed = reg.sweep_expired();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].account_id.as_str(), "idle");
        assert!(reg.validate(&"busy".into(), "t2").is_ok());
    }

    #[test]
    fn touch_before_sweep_keeps_session() {
        let (reg, clock) = registry();
        let _ = login(&reg, "u1", "t1", "a");
        clock.advance(TimeDelta::hours(25));
        assert!(reg.touch(&"u1".into()));
        assert!(reg.sweep_expired().is_empty());
    }

    #[test]
    fn attach_reports_replaced_socket() {
        let (reg, _) = registry();
        let _ = login(&reg, "u1", "t1", "alice");
        assert_eq!(reg.attach_socket(&"u1".into(), "t1", "s1".into()).unwrap(), None);
        let prev = reg.attach_socket(&"u1".into(), "t1", "s2".into()).unwrap();
        assert_eq!(prev.as_deref(), Some("s1"));
        assert_eq!(reg.socket_for_contact(&"alice".into()).as_deref(), Some("s2"));
        assert!(reg.account_for_socket(&"s1".into()).is_none());
        assert_eq!(reg.connected_count(), 1);
    }

    #[test]
    fn attach_with_stale_token_fails() {
        let (reg, _) = registry();
        let _ = login(&reg, "u1", "t1", "alice");
        let _ = login(&reg, "u1", "t2", "alice");
        assert!(reg.attach_socket(&"u1".into(), "t1", "s1".into()).is_err());
        assert!(!reg.is_online(&"alice".into()));
    }

    #[test]
    fn late_detach_of_replaced_socket_is_ignored() {
        let (reg, _) = registry();
        let _ = login(&reg, "u1", "t1", "alice");
        let _ = reg.attach_socket(&"u1".into(), "t1", "s1".into()).unwrap();
        let _ = reg.attach_socket(&"u1".into(), "t1", "s2".into()).unwrap();
        assert!(!reg.detach_socket(&"u1".into(), &"s1".into()));
        assert!(reg.is_online(&"alice".into()));
        assert!(reg.detach_socket(&"u1".into(), &"s2".into()));
        assert!(!reg.is_online(&"alice".into()));
        assert!(reg.validate(&"u1".into(), "t1").is_ok());
    }

    #[test]
    fn new_login_drops_old_socket_binding() {
        let (reg, _) = registry();
        let _ = login(&reg, "u1", "t1", "alice");
        let _ = reg.attach_socket(&"u1".into(), "t1", "s1".into()).unwrap();
        let created = login(&reg, "u1", "t2", "alice");
        assert_eq!(created.superseded.unwrap().socket_id.as_deref(), Some("s1"));
        assert!(!reg.is_online(&"alice".into()));
        assert!(reg.account_for_socket(&"s1".into()).is_none());
    }

    #[test]
    fn token_is_not_stored_in_clear() {
        let (reg, _) = registry();
        let created = login(&reg, "u1", "secret-token", "alice");
        assert!(!format!("{:?}", created.session).contains("secret-token"));
        assert!(created.session.matches_token("secret-token"));
    }

    #[test]
    fn concurrent_logins_leave_exactly_one_session() {
        let (reg, _) = registry();
        let reg = Arc::new(reg);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let reg = reg.clone();
                std::thread::spawn(move || {
                    let _ = reg.create_session(
                        "u1".into(),
                        &format!("t{i}"),
                        "alice".into(),
                        format!("d{i}").as_str().into(),
                    );
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.active_count(), 1);
        let valid = (0..16)
            .filter(|i| reg.validate(&"u1".into(), &format!("t{i}")).is_ok())
            .count();
        assert_eq!(valid, 1);
    }
}
