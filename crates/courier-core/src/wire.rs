//! HTTP request and response bodies shared by server and client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, ClientMessageId, ContactId, DeviceId, MessageId};
use crate::message::{Message, MessageStatus};

/// `POST /auth/login` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// Identity-provider token. Becomes the session credential.
    pub id_token: String,
    /// Contact handle to speak for.
    pub contact_id: ContactId,
    /// Device the login comes from.
    pub device_id: DeviceId,
}

/// `POST /auth/login` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    /// Account subject.
    pub account_id: AccountId,
    /// Bound contact handle.
    pub contact_id: ContactId,
}

/// `GET /auth/me` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    /// Account subject.
    pub account_id: AccountId,
    /// Bound contact handle.
    pub contact_id: ContactId,
    /// Device of the active login.
    pub device_id: DeviceId,
    /// Login time.
    pub created_at: DateTime<Utc>,
    /// Last activity.
    pub last_activity_at: DateTime<Utc>,
    /// Whether a socket is bound.
    pub connected: bool,
}

/// `POST /chat/send` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Recipient handle.
    pub recipient_contact_id: ContactId,
    /// Message body.
    pub content: String,
    /// Sender-generated dedup key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientMessageId>,
}

/// `POST /chat/send` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    /// Server-assigned id.
    pub message_id: MessageId,
    /// Status after acceptance.
    pub status: MessageStatus,
    /// Whether the recipient had a live socket.
    pub recipient_online: bool,
    /// Server-assigned timestamp.
    pub created_at: DateTime<Utc>,
}

/// `GET /chat/{counterpartId}/messages` response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    /// Oldest first.
    pub messages: Vec<Message>,
    /// Whether older messages exist.
    pub has_more: bool,
}

/// One row of `GET /chat/conversations`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    /// The other party.
    pub counterpart_id: ContactId,
    /// Most recent message.
    pub last_message: Message,
}

/// `GET /chat/conversations` response.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationsResponse {
    /// Most recent first.
    pub conversations: Vec<ConversationEntry>,
}

/// Receipt response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptResponse {
    /// Acknowledged message.
    pub message_id: MessageId,
    /// Status after the receipt.
    pub status: MessageStatus,
}

/// `GET /presence/{contactId}` response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResponse {
    /// Queried contact.
    pub contact_id: ContactId,
    /// Whether the contact has a live socket right now.
    pub online: bool,
}
