//! The message record and its delivery status lattice.
//!
//! Status only ever moves forward through
//! `sending → sent → delivered → read`. `failed` sits below `sending`: any
//! later observation of the same message (a server echo, a receipt) lifts it
//! back onto the delivery path, and an explicit resubmit moves it to
//! `sending` again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ClientMessageId, ContactId, MessageId};

/// Delivery status of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Optimistically written locally, network call in flight.
    Sending,
    /// Accepted by the server and assigned a canonical id.
    Sent,
    /// Acknowledged as received by the recipient's client.
    Delivered,
    /// Acknowledged as read by the recipient.
    Read,
    /// Send attempt failed; resubmittable with the same client id.
    Failed,
}

impl MessageStatus {
    /// Position on the forward-only lattice. Higher wins on merge.
    pub fn rank(self) -> u8 {
        match self {
            Self::Failed => 0,
            Self::Sending => 1,
            Self::Sent => 2,
            Self::Delivered => 3,
            Self::Read => 4,
        }
    }

    /// Merge two observations of the same message, keeping the more advanced one.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        if other.rank() > self.rank() { other } else { self }
    }

    /// Whether `self → next` is a legal explicit transition.
    ///
    /// Merges never need this check; it guards the pipeline's own writes.
    pub fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Sending, Self::Sent | Self::Failed)
                | (Self::Failed, Self::Sending)
                | (Self::Sent, Self::Delivered | Self::Read)
                | (Self::Delivered, Self::Read)
        )
    }

    /// Whether the recipient has acknowledged the message at all.
    pub fn is_acknowledged(self) -> bool {
        matches!(self, Self::Delivered | Self::Read)
    }

    /// Wire/storage string for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    /// Parse a wire/storage string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload kind carried by a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// Reference to an image held by the external blob store.
    Image,
    /// System notice.
    System,
}

impl MessageKind {
    /// Wire/storage string for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::System => "system",
        }
    }

    /// Parse a wire/storage string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// A chat message as seen by either end.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned id; absent until the send is confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// Client-generated id; the dedup key before `id` exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientMessageId>,
    /// Sender's contact handle.
    pub sender_contact_id: ContactId,
    /// Recipient's contact handle.
    pub recipient_contact_id: ContactId,
    /// Message body (ciphertext when an encryptor is active).
    pub content: String,
    /// Payload kind.
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    /// Creation time; server-assigned once the send is confirmed.
    pub created_at: DateTime<Utc>,
    /// Delivery status.
    pub status: MessageStatus,
}

impl Message {
    /// Build the optimistic local record for an outgoing message.
    pub fn outgoing(
        sender: ContactId,
        recipient: ContactId,
        content: impl Into<String>,
        client_id: ClientMessageId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            client_id: Some(client_id),
            sender_contact_id: sender,
            recipient_contact_id: recipient,
            content: content.into(),
            kind: MessageKind::Text,
            created_at,
            status: MessageStatus::Sending,
        }
    }

    /// The other party of this message from `owner`'s point of view.
    pub fn counterpart(&self, owner: &ContactId) -> &ContactId {
        if &self.sender_contact_id == owner {
            &self.recipient_contact_id
        } else {
            &self.sender_contact_id
        }
    }

    /// Whether `owner` received this message.
    pub fn is_incoming_for(&self, owner: &ContactId) -> bool {
        &self.recipient_contact_id == owner && &self.sender_contact_id != owner
    }

    /// Whether this message involves `contact` on either side.
    pub fn involves(&self, contact: &ContactId) -> bool {
        &self.sender_contact_id == contact || &self.recipient_contact_id == contact
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [MessageStatus; 5] = [
        MessageStatus::Sending,
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Read,
        MessageStatus::Failed,
    ];

    fn status_strategy() -> impl Strategy<Value = MessageStatus> {
        prop::sample::select(ALL.to_vec())
    }

    #[test]
    fn merge_keeps_more_advanced() {
        assert_eq!(
            MessageStatus::Sent.merge(MessageStatus::Read),
            MessageStatus::Read
        );
        assert_eq!(
            MessageStatus::Read.merge(MessageStatus::Sent),
            MessageStatus::Read
        );
        assert_eq!(
            MessageStatus::Failed.merge(MessageStatus::Sent),
            MessageStatus::Sent
        );
        assert_eq!(
            MessageStatus::Sending.merge(MessageStatus::Failed),
            MessageStatus::Sending
        );
    }

    #[test]
    fn legal_transitions() {
        use MessageStatus::*;
        assert!(Sending.can_transition(Sent));
        assert!(Sending.can_transition(Failed));
        assert!(Failed.can_transition(Sending));
        assert!(Sent.can_transition(Delivered));
        assert!(Sent.can_transition(Read));
        assert!(Delivered.can_transition(Read));
    }

    #[test]
    fn illegal_transitions() {
        use MessageStatus::*;
        assert!(!Read.can_transition(Delivered));
        assert!(!Delivered.can_transition(Sent));
        assert!(!Sent.can_transition(Sending));
        assert!(!Failed.can_transition(Sent));
        assert!(!Read.can_transition(Failed));
    }

    #[test]
    fn status_string_round_trip() {
        for s in ALL {
            assert_eq!(MessageStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(MessageStatus::parse("composing"), None);
    }

    #[test]
    fn message_wire_shape() {
        let msg = Message {
            id: Some(MessageId::from("m1")),
            client_id: Some(ClientMessageId::from("c1")),
            sender_contact_id: ContactId::from("alice"),
            recipient_contact_id: ContactId::from("bob"),
            content: "hi".into(),
            kind: MessageKind::Text,
            created_at: DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            status: MessageStatus::Sent,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["id"], "m1");
        assert_eq!(json["clientId"], "c1");
        assert_eq!(json["senderContactId"], "alice");
        assert_eq!(json["recipientContactId"], "bob");
        assert_eq!(json["type"], "text");
        assert_eq!(json["status"], "sent");
    }

    #[test]
    fn message_without_ids_omits_fields() {
        let msg = Message::outgoing(
            "alice".into(),
            "bob".into(),
            "hi",
            "c1".into(),
            Utc::now(),
        );
        let mut json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("id").is_none());
        let obj = json.as_object_mut().unwrap();
        let _ = obj.remove("type");
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, MessageKind::Text);
        assert_eq!(back.status, MessageStatus::Sending);
    }

    #[test]
    fn counterpart_from_both_sides() {
        let msg = Message::outgoing("alice".into(), "bob".into(), "x", "c".into(), Utc::now());
        assert_eq!(msg.counterpart(&"alice".into()).as_str(), "bob");
        assert_eq!(msg.counterpart(&"bob".into()).as_str(), "alice");
        assert!(msg.is_incoming_for(&"bob".into()));
        assert!(!msg.is_incoming_for(&"alice".into()));
    }

    proptest! {
        #[test]
        fn merge_never_regresses(a in status_strategy(), b in status_strategy()) {
            let merged = a.merge(b);
            prop_assert!(merged.rank() >= a.rank());
            prop_assert!(merged.rank() >= b.rank());
        }

        #[test]
        fn merge_is_idempotent_and_commutative(a in status_strategy(), b in status_strategy()) {
            prop_assert_eq!(a.merge(b), b.merge(a));
            prop_assert_eq!(a.merge(b).merge(b), a.merge(b));
        }
    }
}
