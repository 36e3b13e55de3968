//! Server side of the delivery pipeline.
//!
//! A send is persisted first, then pushed to the recipient's live socket if
//! there is one. The two steps are independent: a failed push is not a
//! failed send, the recipient picks the message up on its next fetch.
//! Receipts (`delivered`, `read`) only ever come from the recipient and only
//! ever move a message forward.

use std::sync::Arc;

use courier_core::clock::SharedClock;
use courier_core::events::ServerEvent;
use courier_core::validation::{validate_content, validate_identifier};
use courier_core::{
    ClientMessageId, ContactId, CourierError, Message, MessageId, MessageKind, MessageStatus,
    Result,
};
use metrics::counter;
use tracing::{debug, info, instrument};

use crate::gateway::hub::ConnectionHub;
use crate::metrics::{MESSAGES_PUSHED_TOTAL, MESSAGES_SENT_TOTAL, RECEIPTS_TOTAL};
use crate::registry::SessionRegistry;
use crate::store::{ConversationHead, MessageStore, NewMessage, Page};

/// Limits applied by the delivery service.
#[derive(Clone, Debug)]
pub struct DeliveryLimits {
    /// Upper bound on message length, in characters.
    pub max_content_chars: usize,
    /// Page size when none is requested.
    pub default_page_limit: usize,
    /// Largest page a caller may request.
    pub max_page_limit: usize,
}

impl Default for DeliveryLimits {
    fn default() -> Self {
        Self {
            max_content_chars: courier_core::validation::DEFAULT_MAX_CONTENT_CHARS,
            default_page_limit: 50,
            max_page_limit: 200,
        }
    }
}

/// An accepted send.
#[derive(Clone, Debug)]
pub struct SendOutcome {
    /// The stored message.
    pub message: Message,
    /// Whether the recipient had a live connection at send time.
    pub recipient_online: bool,
}

/// Persists messages and pushes them to live recipients.
pub struct DeliveryService {
    store: Arc<dyn MessageStore>,
    registry: Arc<SessionRegistry>,
    hub: Arc<ConnectionHub>,
    clock: SharedClock,
    limits: DeliveryLimits,
}

impl DeliveryService {
    /// Create a delivery service.
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: Arc<SessionRegistry>,
        hub: Arc<ConnectionHub>,
        clock: SharedClock,
        limits: DeliveryLimits,
    ) -> Self {
        Self {
            store,
            registry,
            hub,
            clock,
            limits,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MessageStore) -> crate::store::Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| CourierError::internal(format!("store task failed: {e}")))?
            .map_err(CourierError::from)
    }

    /// Accept a message from `sender`, persist it, and push it if possible.
    ///
    /// Replaying a `client_id` returns the originally stored message.
    #[instrument(skip_all, fields(sender = %sender, recipient = %recipient))]
    pub async fn send(
        &self,
        sender: &ContactId,
        recipient: &ContactId,
        content: &str,
        client_id: Option<ClientMessageId>,
    ) -> Result<SendOutcome> {
        validate_identifier("recipientContactId", recipient)?;
        if let Some(cid) = &client_id {
            validate_identifier("clientId", cid)?;
        }
        let content = validate_content(content, self.limits.max_content_chars)?.to_owned();

        let exists = {
            let recipient = recipient.clone();
            self.blocking(move |s| s.contact_exists(&recipient)).await?
        };
        if !exists {
            return Err(CourierError::NotFound(format!("contact {recipient}")));
        }

        let new = NewMessage {
            sender: sender.clone(),
            recipient: recipient.clone(),
            content,
            kind: MessageKind::Text,
            client_id,
        };
        let now = self.clock.now();
        let inserted = self.blocking(move |s| s.insert(new, now)).await?;
        if inserted.created {
            counter!(MESSAGES_SENT_TOTAL).increment(1);
        }

        let recipient_online = match self.registry.socket_for_contact(recipient) {
            Some(socket) => {
                let pushed = self
                    .hub
                    .send_to(&socket, &ServerEvent::NewMessage(inserted.message.clone()));
                if pushed {
                    counter!(MESSAGES_PUSHED_TOTAL).increment(1);
                }
                true
            }
            None => false,
        };

        info!(
            message_id = ?inserted.message.id,
            replayed = !inserted.created,
            recipient_online,
            "message accepted"
        );
        Ok(SendOutcome {
            message: inserted.message,
            recipient_online,
        })
    }

    /// Recipient acknowledges receipt.
    pub async fn mark_delivered(&self, actor: &ContactId, id: &MessageId) -> Result<Message> {
        self.acknowledge(actor, id, MessageStatus::Delivered).await
    }

    /// Recipient acknowledges reading.
    pub async fn mark_read(&self, actor: &ContactId, id: &MessageId) -> Result<Message> {
        self.acknowledge(actor, id, MessageStatus::Read).await
    }

    #[instrument(skip(self), fields(actor = %actor, message_id = %id))]
    async fn acknowledge(
        &self,
        actor: &ContactId,
        id: &MessageId,
        status: MessageStatus,
    ) -> Result<Message> {
        let existing = {
            let id = id.clone();
            self.blocking(move |s| s.get(&id)).await?
        }
        .ok_or_else(|| CourierError::NotFound(format!("message {id}")))?;

        if &existing.recipient_contact_id != actor {
            return Err(CourierError::Forbidden(
                "only the recipient may acknowledge a message".into(),
            ));
        }

        let (message, changed) = {
            let id = id.clone();
            self.blocking(move |s| s.advance_status(&id, status)).await?
        }
        .ok_or_else(|| CourierError::NotFound(format!("message {id}")))?;

        if changed {
            counter!(RECEIPTS_TOTAL, "status" => status.as_str()).increment(1);
            if let Some(socket) = self.registry.socket_for_contact(&message.sender_contact_id) {
                let _ = self.hub.send_to(
                    &socket,
                    &ServerEvent::StatusChanged {
                        message_id: id.clone(),
                        status: message.status,
                        contact_id: actor.clone(),
                    },
                );
            }
        } else {
            debug!(status = %status, current = %message.status, "receipt already applied");
        }
        Ok(message)
    }

    /// A page of the conversation between `owner` and `counterpart`.
    pub async fn list_messages(
        &self,
        owner: &ContactId,
        counterpart: &ContactId,
        limit: Option<usize>,
        before: Option<MessageId>,
    ) -> Result<Page> {
        validate_identifier("counterpartId", counterpart)?;
        let limit = limit
            .unwrap_or(self.limits.default_page_limit)
            .clamp(1, self.limits.max_page_limit);
        let owner = owner.clone();
        let counterpart = counterpart.clone();
        self.blocking(move |s| s.list_conversation(&owner, &counterpart, limit, before.as_ref()))
            .await
    }

    /// Latest message of each of `owner`'s conversations.
    pub async fn list_conversations(&self, owner: &ContactId) -> Result<Vec<ConversationHead>> {
        let owner = owner.clone();
        self.blocking(move |s| s.list_conversations(&owner)).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::connection::ClientConnection;
    use crate::store::SqliteMessageStore;
    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use courier_core::{Clock, ManualClock};
    use tokio::sync::mpsc;

    struct Fixture {
        service: DeliveryService,
        registry: Arc<SessionRegistry>,
        hub: Arc<ConnectionHub>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::default();
        let store = Arc::new(SqliteMessageStore::in_memory().unwrap());
        for (contact, account) in [("alice", "u-alice"), ("bob", "u-bob")] {
            let _ = store
                .claim_contact(&contact.into(), &account.into(), &"d".into(), clock.now())
                .unwrap();
        }
        let registry = Arc::new(SessionRegistry::new(Arc::new(clock.clone()), TimeDelta::hours(24)));
        let hub = Arc::new(ConnectionHub::new());
        let service = DeliveryService::new(
            store,
            registry.clone(),
            hub.clone(),
            Arc::new(clock.clone()),
            DeliveryLimits::default(),
        );
        Fixture {
            service,
            registry,
            hub,
            clock,
        }
    }

    impl Fixture {
        fn connect(&self, contact: &str) -> mpsc::Receiver<Arc<String>> {
            let account = format!("u-{contact}");
            let socket = format!("s-{contact}");
            let _ = self.registry.create_session(
                account.as_str().into(),
                "tok",
                contact.into(),
                "d".into(),
            );
            let _ = self
                .registry
                .attach_socket(&account.as_str().into(), "tok", socket.as_str().into())
                .unwrap();
            let (tx, rx) = mpsc::channel(16);
            let conn = ClientConnection::new(socket.into(), tx);
            conn.bind(account.into(), contact.into());
            self.hub.add(Arc::new(conn));
            rx
        }
    }

    #[tokio::test]
    async fn offline_recipient_gets_no_push() {
        let f = fixture();
        let out = f
            .service
            .send(&"alice".into(), &"bob".into(), "hi", Some("c1".into()))
            .await
            .unwrap();
        assert!(!out.recipient_online);
        assert_eq!(out.message.status, MessageStatus::Sent);
        assert_eq!(out.message.created_at, f.clock.now());
    }

    #[tokio::test]
    async fn online_recipient_gets_push() {
        let f = fixture();
        let mut bob = f.connect("bob");
        let out = f
            .service
            .send(&"alice".into(), &"bob".into(), "  hi  ", Some("c1".into()))
            .await
            .unwrap();
        assert!(out.recipient_online);
        let frame = bob.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "new_message");
        assert_eq!(v["data"]["content"], "hi");
        assert_eq!(v["data"]["clientId"], "c1");
    }

    #[tokio::test]
    async fn replayed_send_returns_same_id() {
        let f = fixture();
        let first = f
            .service
            .send(&"alice".into(), &"bob".into(), "hi", Some("c1".into()))
            .await
            .unwrap();
        f.clock.advance(TimeDelta::seconds(20));
        let second = f
            .service
            .send(&"alice".into(), &"bob".into(), "hi", Some("c1".into()))
            .await
            .unwrap();
        assert_eq!(first.message.id, second.message.id);
        let page = f
            .service
            .list_messages(&"bob".into(), &"alice".into(), None, None)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
    }

    #[tokio::test]
    async fn validation_happens_before_storage() {
        let f = fixture();
        assert_matches!(
            f.service.send(&"alice".into(), &"bob".into(), "   ", None).await,
            Err(CourierError::Validation(_))
        );
        let long = "x".repeat(4_001);
        assert_matches!(
            f.service.send(&"alice".into(), &"bob".into(), &long, None).await,
            Err(CourierError::Validation(_))
        );
        assert_matches!(
            f.service.send(&"alice".into(), &"bad id".into(), "hi", None).await,
            Err(CourierError::Validation(_))
        );
    }

    #[tokio::test]
    async fn unknown_recipient_is_not_found() {
        let f = fixture();
        assert_matches!(
            f.service.send(&"alice".into(), &"zed".into(), "hi", None).await,
            Err(CourierError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn only_recipient_may_acknowledge() {
        let f = fixture();
        let id = f
            .service
            .send(&"alice".into(), &"bob".into(), "hi", None)
            .await
            .unwrap()
            .message
            .id
            .unwrap();
        assert_matches!(
            f.service.mark_read(&"alice".into(), &id).await,
            Err(CourierError::Forbidden(_))
        );
        assert_matches!(
            f.service.mark_read(&"bob".into(), &"missing".into()).await,
            Err(CourierError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn receipts_push_status_to_sender_and_never_regress() {
        let f = fixture();
        let mut alice = f.connect("alice");
        let id = f
            .service
            .send(&"alice".into(), &"bob".into(), "hi", None)
            .await
            .unwrap()
            .message
            .id
            .unwrap();

        let read = f.service.mark_read(&"bob".into(), &id).await.unwrap();
        assert_eq!(read.status, MessageStatus::Read);
        let frame = alice.recv().await.unwrap();
        assert!(frame.contains("message_status") && frame.contains("read"));

        let again = f.service.mark_delivered(&"bob".into(), &id).await.unwrap();
        assert_eq!(again.status, MessageStatus::Read);
        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn page_limit_is_clamped() {
        let f = fixture();
        for i in 0..3 {
            f.clock.advance(TimeDelta::seconds(1));
            let _ = f
                .service
                .send(&"alice".into(), &"bob".into(), &format!("m{i}"), None)
                .await
                .unwrap();
        }
        let page = f
            .service
            .list_messages(&"alice".into(), &"bob".into(), Some(0), None)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].content, "m2");
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn cursor_pages_through_messages_sharing_a_timestamp() {
        let f = fixture();
        for i in 0..5 {
            let _ = f
                .service
                .send(&"alice".into(), &"bob".into(), &format!("m{i}"), None)
                .await
                .unwrap();
        }
        let newest = f
            .service
            .list_messages(&"bob".into(), &"alice".into(), Some(3), None)
            .await
            .unwrap();
        assert!(newest.has_more);
        let older = f
            .service
            .list_messages(&"bob".into(), &"alice".into(), Some(3), newest.messages[0].id.clone())
            .await
            .unwrap();
        assert!(!older.has_more);

        let mut ids: Vec<_> = older
            .messages
            .iter()
            .chain(&newest.messages)
            .filter_map(|m| m.id.clone())
            .collect();
        assert_eq!(ids.len(), 5);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);

        assert_matches!(
            f.service
                .list_messages(&"bob".into(), &"alice".into(), None, Some("missing".into()))
                .await,
            Err(CourierError::NotFound(_))
        );
    }
}
