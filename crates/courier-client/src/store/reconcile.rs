//! The reconciliation store proper.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use courier_core::dedup::{DedupPolicy, merge_into};
use courier_core::summary::{ChatSummary, sort_by_recency, summarize};
use courier_core::{
    ClientMessageId, ContactId, CourierError, Message, MessageId, MessageStatus, SharedClock,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::records::{self, CacheEnvelope, RecordDb, RecordKey};
use super::{Contact, Profile, Result, StoreError};
use crate::config::ClientConfig;

/// Merge and retention policy.
#[derive(Clone, Copy, Debug)]
pub struct StoreOptions {
    /// Duplicate detection.
    pub dedup: DedupPolicy,
    /// Per-chat count that triggers eviction.
    pub high_water: usize,
    /// Per-chat count eviction trims down to.
    pub low_water: usize,
    /// Freshness window for `cache:` entries.
    pub cache_ttl: TimeDelta,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl StoreOptions {
    /// Take the cache policy from client config.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            dedup: config.dedup,
            high_water: config.high_water,
            low_water: config.low_water.min(config.high_water),
            cache_ttl: config.cache_ttl,
        }
    }
}

/// What a load found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Chats restored.
    pub chats: usize,
    /// Messages restored.
    pub messages: usize,
    /// Records or elements dropped as corrupt.
    pub dropped: usize,
}

/// What a merge changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// New messages added.
    pub inserted: usize,
    /// Existing messages advanced.
    pub updated: usize,
    /// Oldest messages evicted afterwards.
    pub evicted: usize,
}

impl MergeOutcome {
    /// Whether anything changed.
    pub fn changed(&self) -> bool {
        self.inserted + self.updated + self.evicted > 0
    }
}

struct State {
    db: RecordDb,
    chats: HashMap<ContactId, Vec<Message>>,
    contacts: HashMap<ContactId, Contact>,
    profile: Option<Profile>,
    presence: HashMap<ContactId, bool>,
}

/// Local message/contact cache for one owner.
pub struct ReconciliationStore {
    owner: ContactId,
    options: StoreOptions,
    clock: SharedClock,
    state: Mutex<State>,
}

impl std::fmt::Debug for ReconciliationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationStore")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl ReconciliationStore {
    /// Open the file-backed cache at `path` and load it.
    pub fn open(
        path: &str,
        owner: ContactId,
        options: StoreOptions,
        clock: SharedClock,
    ) -> Result<Self> {
        Self::with_db(RecordDb::open(path)?, owner, options, clock)
    }

    /// In-memory cache.
    pub fn in_memory(owner: ContactId, options: StoreOptions, clock: SharedClock) -> Result<Self> {
        Self::with_db(RecordDb::in_memory()?, owner, options, clock)
    }

    fn with_db(
        db: RecordDb,
        owner: ContactId,
        options: StoreOptions,
        clock: SharedClock,
    ) -> Result<Self> {
        let store = Self {
            owner,
            options,
            clock,
            state: Mutex::new(State {
                db,
                chats: HashMap::new(),
                contacts: HashMap::new(),
                profile: None,
                presence: HashMap::new(),
            }),
        };
        let _ = store.load()?;
        Ok(store)
    }

    /// Contact the cache belongs to.
    pub fn owner(&self) -> &ContactId {
        &self.owner
    }

    // ─────────────────────────────────────────────────────────────────────
    // Load
    // ─────────────────────────────────────────────────────────────────────

    /// Rebuild memory from disk. Records that fail validation are dropped
    /// (and removed or rewritten) instead of failing the load.
    pub fn load(&self) -> Result<LoadReport> {
        let mut state = self.state.lock();
        let mut report = LoadReport::default();
        state.chats.clear();
        state.contacts.clear();
        state.profile = None;

        for (key, payload) in state.db.all()? {
            match RecordKey::parse(&key) {
                Some(RecordKey::Contacts) => {
                    let (contacts, dropped) = decode_elements::<Contact>(&key, &payload);
                    report.dropped += dropped;
                    match contacts {
                        Some(contacts) => {
                            if dropped > 0 {
                                state.db.put_json(&key, &contacts)?;
                            }
                            state.contacts = contacts
                                .into_iter()
                                .map(|c| (c.contact_id.clone(), c))
                                .collect();
                        }
                        None => {
                            let _ = state.db.delete(&key)?;
                        }
                    }
                }
                Some(RecordKey::Profile) => match serde_json::from_str::<Profile>(&payload) {
                    Ok(profile) => state.profile = Some(profile),
                    Err(err) => {
                        report_corrupt(&key, &err.to_string());
                        report.dropped += 1;
                        let _ = state.db.delete(&key)?;
                    }
                },
                Some(RecordKey::ChatMessages(counterpart)) => {
                    let (messages, dropped) = decode_elements::<Message>(&key, &payload);
                    report.dropped += dropped;
                    let Some(mut messages) = messages else {
                        let _ = state.db.delete(&key)?;
                        continue;
                    };
                    let before = messages.len();
                    messages.retain(|m| m.involves(&self.owner) && m.involves(&counterpart));
                    let foreign = before - messages.len();
                    if foreign > 0 {
                        report_corrupt(&key, &format!("{foreign} messages outside this chat"));
                        report.dropped += foreign;
                    }
                    let messages = self.normalize(messages);
                    if dropped + foreign > 0 {
                        state.db.put_json(&key, &messages)?;
                    }
                    report.chats += 1;
                    report.messages += messages.len();
                    let _ = state.chats.insert(counterpart, messages);
                }
                Some(RecordKey::ChatSummary(_)) => {
                    if let Err(err) = serde_json::from_str::<ChatSummary>(&payload) {
                        report_corrupt(&key, &err.to_string());
                        report.dropped += 1;
                        let _ = state.db.delete(&key)?;
                    }
                }
                Some(RecordKey::Cache(_)) => {}
                None => debug!(key, "ignoring unknown cache record"),
            }
        }

        info!(
            chats = report.chats,
            messages = report.messages,
            dropped = report.dropped,
            "local cache loaded"
        );
        Ok(report)
    }

    /// Fold a freshly decoded list through the merge rule so stored duplicates
    /// collapse, then order it.
    fn normalize(&self, messages: Vec<Message>) -> Vec<Message> {
        let mut out: Vec<Message> = Vec::with_capacity(messages.len());
        for message in messages {
            let _ = absorb(&self.options.dedup, &mut out, &message);
        }
        sort_messages(&mut out);
        out
    }

    // ─────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────

    /// Write the optimistic copy of an outgoing message. A resubmission with
    /// a known client id folds into the existing record.
    pub fn record_local(&self, message: &Message) -> Result<()> {
        let counterpart = message.counterpart(&self.owner).clone();
        let mut state = self.state.lock();
        let chat = state.chats.entry(counterpart.clone()).or_default();
        let _ = absorb(&self.options.dedup, chat, message);
        sort_messages(chat);
        let _ = self.evict_locked(&mut state, &counterpart);
        self.persist_chat(&state, &counterpart)
    }

    /// Merge remote observations of the chat with `counterpart`. Safe to call
    /// repeatedly with overlapping data.
    pub fn merge_remote(&self, counterpart: &ContactId, remote: &[Message]) -> Result<MergeOutcome> {
        let mut outcome = MergeOutcome::default();
        let mut state = self.state.lock();
        let chat = state.chats.entry(counterpart.clone()).or_default();

        for message in remote {
            if !(message.involves(&self.owner) && message.involves(counterpart)) {
                debug!(counterpart = %counterpart, "skipping message outside this chat");
                continue;
            }
            match absorb(&self.options.dedup, chat, message) {
                Absorbed::Inserted => outcome.inserted += 1,
                Absorbed::Updated => outcome.updated += 1,
                Absorbed::Unchanged => {}
            }
        }
        sort_messages(chat);
        outcome.evicted = self.evict_locked(&mut state, counterpart);

        if outcome.changed() {
            debug!(
                counterpart = %counterpart,
                inserted = outcome.inserted,
                updated = outcome.updated,
                evicted = outcome.evicted,
                "merged remote messages"
            );
            self.persist_chat(&state, counterpart)?;
        }
        Ok(outcome)
    }

    /// The send with `client_id` was accepted as `id` at `created_at`.
    pub fn confirm_sent(
        &self,
        counterpart: &ContactId,
        client_id: &ClientMessageId,
        id: MessageId,
        created_at: DateTime<Utc>,
    ) -> Result<Message> {
        let mut state = self.state.lock();
        let chat = state.chats.entry(counterpart.clone()).or_default();
        let pos = chat
            .iter()
            .position(|m| m.client_id.as_ref() == Some(client_id))
            .ok_or_else(|| StoreError::UnknownMessage(client_id.to_string()))?;

        let mut local = chat.remove(pos);
        local.id = Some(id.clone());
        local.created_at = created_at;
        local.status = local.status.merge(MessageStatus::Sent);

        // A pushed or polled copy with the server id may already be here.
        let stored = match chat.iter().position(|m| m.id.as_ref() == Some(&id)) {
            Some(dup) => {
                let _ = merge_into(&mut chat[dup], &local);
                chat[dup].clone()
            }
            None => {
                chat.push(local.clone());
                local
            }
        };
        sort_messages(chat);
        self.persist_chat(&state, counterpart)?;
        Ok(stored)
    }

    /// The send with `client_id` failed. Leaves already-confirmed copies alone.
    pub fn mark_failed(&self, counterpart: &ContactId, client_id: &ClientMessageId) -> Result<bool> {
        self.transition(counterpart, client_id, MessageStatus::Failed)
    }

    /// Flip a failed message back to `sending` for a resubmission.
    pub fn mark_resending(
        &self,
        counterpart: &ContactId,
        client_id: &ClientMessageId,
    ) -> Result<Message> {
        let _ = self.transition(counterpart, client_id, MessageStatus::Sending)?;
        self.find_by_client_id(counterpart, client_id)
            .ok_or_else(|| StoreError::UnknownMessage(client_id.to_string()))
    }

    fn transition(
        &self,
        counterpart: &ContactId,
        client_id: &ClientMessageId,
        next: MessageStatus,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(message) = state
            .chats
            .get_mut(counterpart)
            .and_then(|chat| chat.iter_mut().find(|m| m.client_id.as_ref() == Some(client_id)))
        else {
            return Err(StoreError::UnknownMessage(client_id.to_string()));
        };
        if !message.status.can_transition(next) {
            debug!(
                client_id = %client_id,
                from = %message.status,
                to = %next,
                "status transition skipped"
            );
            return Ok(false);
        }
        message.status = next;
        self.persist_chat(&state, counterpart)?;
        Ok(true)
    }

    /// Advance the status of the message with server id `id`, wherever it is.
    /// Returns `false` if it is unknown locally or the status would regress.
    pub fn set_status(&self, id: &MessageId, status: MessageStatus) -> Result<bool> {
        let mut state = self.state.lock();
        let mut changed_in = None;
        for (counterpart, chat) in &mut state.chats {
            if let Some(message) = chat.iter_mut().find(|m| m.id.as_ref() == Some(id)) {
                let merged = message.status.merge(status);
                if merged != message.status {
                    message.status = merged;
                    changed_in = Some(counterpart.clone());
                }
                break;
            }
        }
        match changed_in {
            Some(counterpart) => {
                self.persist_chat(&state, &counterpart)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Messages of one chat, oldest first.
    pub fn messages(&self, counterpart: &ContactId) -> Vec<Message> {
        self.state
            .lock()
            .chats
            .get(counterpart)
            .cloned()
            .unwrap_or_default()
    }

    /// Local copy with `client_id`.
    pub fn find_by_client_id(
        &self,
        counterpart: &ContactId,
        client_id: &ClientMessageId,
    ) -> Option<Message> {
        self.state.lock().chats.get(counterpart).and_then(|chat| {
            chat.iter()
                .find(|m| m.client_id.as_ref() == Some(client_id))
                .cloned()
        })
    }

    /// Counterparts with a local chat.
    pub fn chat_ids(&self) -> Vec<ContactId> {
        let mut ids: Vec<ContactId> = self.state.lock().chats.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Trim the chat to the low-water mark if it is past the high-water mark,
    /// discarding the oldest first. Returns how many were removed.
    pub fn evict(&self, counterpart: &ContactId) -> Result<usize> {
        let mut state = self.state.lock();
        let evicted = self.evict_locked(&mut state, counterpart);
        if evicted > 0 {
            self.persist_chat(&state, counterpart)?;
        }
        Ok(evicted)
    }

    fn evict_locked(&self, state: &mut State, counterpart: &ContactId) -> usize {
        let Some(chat) = state.chats.get_mut(counterpart) else {
            return 0;
        };
        if chat.len() <= self.options.high_water {
            return 0;
        }
        let excess = chat.len() - self.options.low_water;
        let _ = chat.drain(..excess);
        info!(counterpart = %counterpart, evicted = excess, kept = chat.len(), "evicted old messages");
        excess
    }

    // ─────────────────────────────────────────────────────────────────────
    // Summaries
    // ─────────────────────────────────────────────────────────────────────

    /// One summary per non-empty chat, most recent first.
    pub fn chat_summaries(&self) -> Vec<ChatSummary> {
        let state = self.state.lock();
        let mut summaries: Vec<ChatSummary> = state
            .chats
            .iter()
            .filter_map(|(counterpart, messages)| self.summary_for(&state, counterpart, messages))
            .collect();
        sort_by_recency(&mut summaries);
        summaries
    }

    fn summary_for(
        &self,
        state: &State,
        counterpart: &ContactId,
        messages: &[Message],
    ) -> Option<ChatSummary> {
        summarize(
            &self.owner,
            counterpart,
            messages,
            state
                .contacts
                .get(counterpart)
                .map(|c| c.display_name.as_str()),
            state.presence.get(counterpart).copied().unwrap_or(false),
        )
    }

    fn persist_chat(&self, state: &State, counterpart: &ContactId) -> Result<()> {
        let messages = state
            .chats
            .get(counterpart)
            .map_or(&[][..], Vec::as_slice);
        state
            .db
            .put_json(&records::chat_messages(counterpart), messages)?;
        match self.summary_for(state, counterpart, messages) {
            Some(summary) => state
                .db
                .put_json(&records::chat_summary(counterpart), &summary)?,
            None => {
                let _ = state.db.delete(&records::chat_summary(counterpart))?;
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Contacts, profile, presence
    // ─────────────────────────────────────────────────────────────────────

    /// Replace the contact list.
    pub fn put_contacts(&self, contacts: Vec<Contact>) -> Result<()> {
        let mut state = self.state.lock();
        state.db.put_json(records::CONTACTS, &contacts)?;
        state.contacts = contacts
            .into_iter()
            .map(|c| (c.contact_id.clone(), c))
            .collect();
        Ok(())
    }

    /// Known contacts, ordered by handle.
    pub fn contacts(&self) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self.state.lock().contacts.values().cloned().collect();
        contacts.sort_by(|a, b| a.contact_id.cmp(&b.contact_id));
        contacts
    }

    /// Replace the profile.
    pub fn put_profile(&self, profile: &Profile) -> Result<()> {
        let mut state = self.state.lock();
        state.db.put_json(records::PROFILE, profile)?;
        state.profile = Some(profile.clone());
        Ok(())
    }

    /// Stored profile.
    pub fn profile(&self) -> Option<Profile> {
        self.state.lock().profile.clone()
    }

    /// Record point-in-time presence. Memory only.
    pub fn set_presence(&self, contact: &ContactId, online: bool) {
        let _ = self.state.lock().presence.insert(contact.clone(), online);
    }

    /// Last known presence.
    pub fn is_online(&self, contact: &ContactId) -> bool {
        self.state
            .lock()
            .presence
            .get(contact)
            .copied()
            .unwrap_or(false)
    }

    // ─────────────────────────────────────────────────────────────────────
    // TTL cache
    // ─────────────────────────────────────────────────────────────────────

    /// Store `value` under `cache:<key>` with the configured TTL.
    pub fn cache_put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let envelope = CacheEnvelope {
            stored_at: self.clock.now(),
            ttl_ms: self.options.cache_ttl.num_milliseconds(),
            payload: serde_json::to_value(value)?,
        };
        self.state
            .lock()
            .db
            .put_json(&records::cache(key), &envelope)
    }

    /// Fresh value under `cache:<key>`. Expired or unreadable entries are
    /// removed and read as a miss.
    pub fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let full = records::cache(key);
        let state = self.state.lock();
        let Some(payload) = state.db.get(&full)? else {
            return Ok(None);
        };
        let envelope = match serde_json::from_str::<CacheEnvelope>(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                report_corrupt(&full, &err.to_string());
                let _ = state.db.delete(&full)?;
                return Ok(None);
            }
        };
        if envelope.is_expired(self.clock.now()) {
            debug!(key = %full, "cache entry expired");
            let _ = state.db.delete(&full)?;
            return Ok(None);
        }
        match serde_json::from_value(envelope.payload) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                report_corrupt(&full, &err.to_string());
                let _ = state.db.delete(&full)?;
                Ok(None)
            }
        }
    }

    /// Forget everything, on disk and in memory.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.db.clear()?;
        state.chats.clear();
        state.contacts.clear();
        state.profile = None;
        state.presence.clear();
        info!("local cache cleared");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

enum Absorbed {
    Inserted,
    Updated,
    Unchanged,
}

/// Merge `incoming` into `chat` under the dedup rule.
fn absorb(dedup: &DedupPolicy, chat: &mut Vec<Message>, incoming: &Message) -> Absorbed {
    match dedup.find(chat, incoming) {
        Some(pos) => {
            if merge_into(&mut chat[pos], incoming) {
                Absorbed::Updated
            } else {
                Absorbed::Unchanged
            }
        }
        None => {
            chat.push(incoming.clone());
            Absorbed::Inserted
        }
    }
}

/// Oldest first by server time; ties broken by id so order is stable.
fn sort_messages(chat: &mut [Message]) {
    chat.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
            .then_with(|| a.client_id.cmp(&b.client_id))
    });
}

fn report_corrupt(key: &str, reason: &str) {
    let err = CourierError::StorageCorrupt {
        key: key.to_owned(),
        reason: reason.to_owned(),
    };
    warn!(error = %err, "dropping corrupt cache record");
}

/// Decode a JSON array element by element. `None` if the record is not an
/// array at all; otherwise the valid elements plus how many were dropped.
fn decode_elements<T: DeserializeOwned>(key: &str, payload: &str) -> (Option<Vec<T>>, usize) {
    let values = match serde_json::from_str::<Vec<serde_json::Value>>(payload) {
        Ok(values) => values,
        Err(err) => {
            report_corrupt(key, &err.to_string());
            return (None, 1);
        }
    };
    let mut dropped = 0;
    let items = values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<T>(value) {
            Ok(item) => Some(item),
            Err(err) => {
                report_corrupt(key, &err.to_string());
                dropped += 1;
                None
            }
        })
        .collect();
    (Some(items), dropped)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use courier_core::{Clock, ManualClock};
    use proptest::prelude::*;
    use serde_json::json;

    fn alice() -> ContactId {
        "alice".into()
    }

    fn bob() -> ContactId {
        "bob".into()
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn store_with(options: StoreOptions) -> (ReconciliationStore, ManualClock) {
        let clock = ManualClock::default();
        let store =
            ReconciliationStore::in_memory(alice(), options, Arc::new(clock.clone())).unwrap();
        (store, clock)
    }

    fn store() -> ReconciliationStore {
        store_with(StoreOptions::default()).0
    }

    fn remote(id: &str, from: &str, to: &str, secs: i64, status: MessageStatus) -> Message {
        Message {
            id: Some(id.into()),
            client_id: None,
            sender_contact_id: from.into(),
            recipient_contact_id: to.into(),
            content: format!("body {id}"),
            kind: courier_core::MessageKind::Text,
            created_at: t(secs),
            status,
        }
    }

    fn pending(client: &str, secs: i64) -> Message {
        Message::outgoing(alice(), bob(), "hi", client.into(), t(secs))
    }

    #[test]
    fn merge_sorts_by_created_at() {
        let store = store();
        let outcome = store
            .merge_remote(
                &bob(),
                &[
                    remote("m2", "bob", "alice", 20, MessageStatus::Sent),
                    remote("m1", "alice", "bob", 10, MessageStatus::Sent),
                ],
            )
            .unwrap();
        assert_eq!(outcome.inserted, 2);
        let ids: Vec<_> = store
            .messages(&bob())
            .into_iter()
            .map(|m| m.id.unwrap().into_inner())
            .collect();
        assert_eq!(ids, ["m1", "m2"]);
    }

    #[test]
    fn merge_is_idempotent_and_forward_only() {
        let store = store();
        let read = remote("m1", "bob", "alice", 5, MessageStatus::Read);
        let _ = store.merge_remote(&bob(), &[read.clone()]).unwrap();
        let again = store.merge_remote(&bob(), &[read]).unwrap();
        assert!(!again.changed());

        let stale = remote("m1", "bob", "alice", 5, MessageStatus::Sent);
        let outcome = store.merge_remote(&bob(), &[stale]).unwrap();
        assert!(!outcome.changed());
        let stored = store.messages(&bob());
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, MessageStatus::Read);
    }

    #[test]
    fn retried_send_collapses_to_one_sent_message() {
        // First attempt timed out locally but succeeded on the server as m1.
        let store = store();
        let local = pending("c1", 0);
        store.record_local(&local).unwrap();
        let _ = store.mark_failed(&bob(), &"c1".into()).unwrap();

        let resent = store.mark_resending(&bob(), &"c1".into()).unwrap();
        assert_eq!(resent.status, MessageStatus::Sending);
        let confirmed = store
            .confirm_sent(&bob(), &"c1".into(), "m1".into(), t(1))
            .unwrap();
        assert_eq!(confirmed.id.as_ref().map(MessageId::as_str), Some("m1"));

        let mut from_server = remote("m1", "alice", "bob", 1, MessageStatus::Sent);
        from_server.content = "hi".into();
        from_server.client_id = Some("c1".into());
        let _ = store.merge_remote(&bob(), &[from_server]).unwrap();

        let stored = store.messages(&bob());
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, MessageStatus::Sent);
        assert_eq!(stored[0].id.as_ref().map(MessageId::as_str), Some("m1"));
        assert_eq!(stored[0].client_id.as_ref().map(ClientMessageId::as_str), Some("c1"));
    }

    #[test]
    fn confirm_folds_into_copy_that_arrived_first() {
        let store = store();
        store.record_local(&pending("c1", 0)).unwrap();
        // Poll delivered the server copy, without client id, before the
        // send response came back.
        let mut early = remote("m1", "alice", "bob", 1, MessageStatus::Delivered);
        early.content = "different".into();
        let _ = store.merge_remote(&bob(), &[early]).unwrap();
        assert_eq!(store.messages(&bob()).len(), 2);

        let confirmed = store
            .confirm_sent(&bob(), &"c1".into(), "m1".into(), t(1))
            .unwrap();
        let stored = store.messages(&bob());
        assert_eq!(stored.len(), 1);
        assert_eq!(confirmed.status, MessageStatus::Delivered);
        assert_eq!(stored[0].client_id.as_ref().map(ClientMessageId::as_str), Some("c1"));
    }

    #[test]
    fn failed_only_from_sending() {
        let store = store();
        store.record_local(&pending("c1", 0)).unwrap();
        let _ = store
            .confirm_sent(&bob(), &"c1".into(), "m1".into(), t(0))
            .unwrap();
        assert!(!store.mark_failed(&bob(), &"c1".into()).unwrap());
        assert_eq!(store.messages(&bob())[0].status, MessageStatus::Sent);
        assert_matches!(
            store.mark_failed(&bob(), &"nope".into()),
            Err(StoreError::UnknownMessage(_))
        );
    }

    #[test]
    fn set_status_advances_by_server_id() {
        let store = store();
        let _ = store
            .merge_remote(&bob(), &[remote("m1", "alice", "bob", 0, MessageStatus::Sent)])
            .unwrap();
        assert!(store.set_status(&"m1".into(), MessageStatus::Read).unwrap());
        assert!(!store.set_status(&"m1".into(), MessageStatus::Delivered).unwrap());
        assert!(!store.set_status(&"m9".into(), MessageStatus::Read).unwrap());
        assert_eq!(store.messages(&bob())[0].status, MessageStatus::Read);
    }

    #[test]
    fn messages_for_other_chats_are_skipped() {
        let store = store();
        let outcome = store
            .merge_remote(&bob(), &[remote("m1", "carol", "alice", 0, MessageStatus::Sent)])
            .unwrap();
        assert_eq!(outcome.inserted, 0);
    }

    #[test]
    fn eviction_keeps_newest_low_water() {
        let (store, _) = store_with(StoreOptions {
            high_water: 1_000,
            low_water: 500,
            ..StoreOptions::default()
        });
        let batch: Vec<Message> = (0..1_001)
            .map(|i| remote(&format!("m{i:04}"), "bob", "alice", i, MessageStatus::Sent))
            .collect();
        let outcome = store.merge_remote(&bob(), &batch).unwrap();
        assert_eq!(outcome.evicted, 501);

        let kept = store.messages(&bob());
        assert_eq!(kept.len(), 500);
        assert_eq!(kept.first().unwrap().created_at, t(501));
        assert_eq!(kept.last().unwrap().created_at, t(1_000));
    }

    #[test]
    fn evict_below_high_water_is_noop() {
        let store = store();
        let _ = store
            .merge_remote(&bob(), &[remote("m1", "bob", "alice", 0, MessageStatus::Sent)])
            .unwrap();
        assert_eq!(store.evict(&bob()).unwrap(), 0);
        assert_eq!(store.evict(&"nobody".into()).unwrap(), 0);
    }

    #[test]
    fn summaries_use_contacts_presence_and_recency() {
        let store = store();
        store
            .put_contacts(vec![Contact {
                contact_id: bob(),
                display_name: "Bob".into(),
            }])
            .unwrap();
        store.set_presence(&bob(), true);
        let _ = store
            .merge_remote(
                &bob(),
                &[
                    remote("m1", "bob", "alice", 10, MessageStatus::Sent),
                    remote("m2", "bob", "alice", 11, MessageStatus::Read),
                ],
            )
            .unwrap();
        let _ = store
            .merge_remote(&"carol".into(), &[remote("m3", "carol", "alice", 50, MessageStatus::Sent)])
            .unwrap();

        let summaries = store.chat_summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].counterpart_id.as_str(), "carol");
        assert_eq!(summaries[0].display_name, "carol");
        assert_eq!(summaries[1].display_name, "Bob");
        assert_eq!(summaries[1].unread_count, 1);
        assert!(summaries[1].online);
    }

    #[test]
    fn cache_entries_expire_lazily() {
        let (store, clock) = store_with(StoreOptions {
            cache_ttl: TimeDelta::seconds(60),
            ..StoreOptions::default()
        });
        store.cache_put("lookup:bob", &json!({"name": "Bob"})).unwrap();
        clock.advance(TimeDelta::seconds(59));
        let hit: Option<serde_json::Value> = store.cache_get("lookup:bob").unwrap();
        assert_eq!(hit, Some(json!({"name": "Bob"})));

        clock.advance(TimeDelta::seconds(2));
        let miss: Option<serde_json::Value> = store.cache_get("lookup:bob").unwrap();
        assert!(miss.is_none());
        let missing: Option<String> = store.cache_get("never").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn profile_and_contacts_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let path = path.to_str().unwrap();
        let clock: SharedClock = Arc::new(ManualClock::default());
        {
            let store =
                ReconciliationStore::open(path, alice(), StoreOptions::default(), clock.clone())
                    .unwrap();
            store
                .put_profile(&Profile {
                    account_id: "u1".into(),
                    contact_id: alice(),
                    device_id: "d1".into(),
                })
                .unwrap();
            store
                .put_contacts(vec![Contact {
                    contact_id: bob(),
                    display_name: "Bob".into(),
                }])
                .unwrap();
            store.record_local(&pending("c1", 0)).unwrap();
        }
        let store =
            ReconciliationStore::open(path, alice(), StoreOptions::default(), clock).unwrap();
        assert_eq!(store.profile().unwrap().device_id.as_str(), "d1");
        assert_eq!(store.contacts().len(), 1);
        assert_eq!(store.messages(&bob()).len(), 1);
        assert_eq!(store.chat_ids(), vec![bob()]);
    }

    #[test]
    fn corrupt_records_are_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let path = path.to_str().unwrap();
        let clock: SharedClock = Arc::new(ManualClock::default());
        let store =
            ReconciliationStore::open(path, alice(), StoreOptions::default(), clock.clone())
                .unwrap();
        store.record_local(&pending("c1", 0)).unwrap();
        drop(store);

        let db = RecordDb::open(path).unwrap();
        let good = serde_json::to_value(pending("c2", 5)).unwrap();
        let payload = json!([good, {"content": "no sender"}, 42]).to_string();
        db.put(&records::chat_messages(&bob()), &payload).unwrap();
        db.put(&records::chat_messages(&"carol".into()), "not json").unwrap();
        db.put(records::PROFILE, "{\"accountId\": 1}").unwrap();
        db.put(&records::cache("x"), "garbage").unwrap();
        drop(db);

        let store = ReconciliationStore::open(path, alice(), StoreOptions::default(), clock).unwrap();
        let report = store.load().unwrap();
        assert_eq!(report.dropped, 0, "first open already healed the records");
        assert_eq!(store.messages(&bob()).len(), 1);
        assert!(store.messages(&"carol".into()).is_empty());
        assert!(store.profile().is_none());
        let cached: Option<String> = store.cache_get("x").unwrap();
        assert!(cached.is_none());
    }

    #[test]
    fn load_reports_dropped_elements() {
        let store = store();
        {
            let state = store.state.lock();
            let good = serde_json::to_value(pending("c1", 0)).unwrap();
            state
                .db
                .put(
                    &records::chat_messages(&bob()),
                    &json!([good, {"id": "broken"}]).to_string(),
                )
                .unwrap();
            state.db.put(records::CONTACTS, "{}").unwrap();
        }
        let report = store.load().unwrap();
        assert_eq!(report.chats, 1);
        assert_eq!(report.messages, 1);
        assert_eq!(report.dropped, 2);
    }

    #[test]
    fn clear_forgets_everything() {
        let store = store();
        store.record_local(&pending("c1", 0)).unwrap();
        store.cache_put("k", &1).unwrap();
        store.clear().unwrap();
        assert!(store.messages(&bob()).is_empty());
        assert!(store.chat_summaries().is_empty());
        assert_eq!(store.load().unwrap(), LoadReport::default());
    }

    fn status_strategy() -> impl Strategy<Value = MessageStatus> {
        prop_oneof![
            Just(MessageStatus::Sent),
            Just(MessageStatus::Delivered),
            Just(MessageStatus::Read),
        ]
    }

    proptest! {
        #[test]
        fn remerging_never_duplicates_or_regresses(
            batch in proptest::collection::vec((0u8..20, 0i64..1_000, status_strategy()), 1..40)
        ) {
            let store = store();
            let messages: Vec<Message> = batch
                .iter()
                .map(|(id, secs, status)| remote(&format!("m{id}"), "bob", "alice", *secs, *status))
                .collect();
            let _ = store.merge_remote(&bob(), &messages).unwrap();
            let first = store.messages(&bob());
            let _ = store.merge_remote(&bob(), &messages).unwrap();
            let second = store.messages(&bob());
            prop_assert_eq!(&first, &second);

            let mut ids: Vec<_> = second.iter().filter_map(|m| m.id.clone()).collect();
            let before = ids.len();
            ids.sort();
            ids.dedup();
            prop_assert_eq!(before, ids.len());

            for stored in &second {
                for m in messages.iter().filter(|m| m.id == stored.id) {
                    prop_assert!(stored.status.rank() >= m.status.rank());
                }
            }
            prop_assert!(second.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        }

        #[test]
        fn eviction_always_keeps_the_newest(
            times in proptest::collection::vec(0i64..10_000, 1..120),
        ) {
            let (store, _) = store_with(StoreOptions {
                high_water: 30,
                low_water: 10,
                ..StoreOptions::default()
            });
            let messages: Vec<Message> = times
                .iter()
                .enumerate()
                .map(|(i, secs)| remote(&format!("m{i:03}"), "bob", "alice", *secs, MessageStatus::Sent))
                .collect();
            for chunk in messages.chunks(7) {
                let _ = store.merge_remote(&bob(), chunk).unwrap();
            }
            let kept = store.messages(&bob());
            prop_assert!(kept.len() <= 30);

            let mut all = messages.clone();
            sort_messages(&mut all);
            let newest_k = kept.len().min(10);
            let expected = &all[all.len() - newest_k..];
            prop_assert_eq!(&kept[kept.len() - newest_k..], expected);
        }
    }

    #[test]
    fn clock_drives_cache_timestamps() {
        let (store, clock) = store_with(StoreOptions::default());
        store.cache_put("k", &"v").unwrap();
        let raw = store.state.lock().db.get(&records::cache("k")).unwrap().unwrap();
        let env: CacheEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(env.stored_at, clock.now());
    }
}
