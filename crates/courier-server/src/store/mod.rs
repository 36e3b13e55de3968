//! Authoritative message store.
//!
//! [`MessageStore`] is the seam between the delivery service and storage.
//! [`SqliteMessageStore`] is the production implementation: an `r2d2` pool
//! over `SQLite`, schema managed by embedded migrations.

pub mod connection;
pub mod migrations;
mod sqlite;

pub use sqlite::SqliteMessageStore;

use chrono::{DateTime, Utc};
use courier_core::{
    AccountId, ClientMessageId, ContactId, CourierError, DeviceId, Message, MessageId,
    MessageKind, MessageStatus,
};
use thiserror::Error;

/// Errors from the message store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Which migration failed and why.
        message: String,
    },

    /// A stored row could not be decoded.
    #[error("corrupt row in {table}: {reason}")]
    CorruptRow {
        /// Table the row came from.
        table: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// A client id was reused for a different message.
    #[error("client id {0} already used for a different message")]
    ClientIdConflict(String),

    /// A paging cursor named a message outside the conversation.
    #[error("unknown cursor message {0}")]
    UnknownCursor(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for CourierError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ClientIdConflict(_) => Self::DeliveryRejected(err.to_string()),
            StoreError::UnknownCursor(_) => Self::NotFound(err.to_string()),
            StoreError::CorruptRow { table, reason } => Self::StorageCorrupt {
                key: table.to_string(),
                reason,
            },
            other => Self::Internal(other.to_string()),
        }
    }
}

/// A message about to be persisted.
#[derive(Clone, Debug)]
pub struct NewMessage {
    /// Sender's contact handle.
    pub sender: ContactId,
    /// Recipient's contact handle.
    pub recipient: ContactId,
    /// Body.
    pub content: String,
    /// Payload kind.
    pub kind: MessageKind,
    /// Sender-generated dedup key.
    pub client_id: Option<ClientMessageId>,
}

/// Outcome of [`MessageStore::insert`].
#[derive(Clone, Debug)]
pub struct Inserted {
    /// The stored message.
    pub message: Message,
    /// `false` if an earlier send with the same client id was returned.
    pub created: bool,
}

/// One page of a conversation, oldest first.
#[derive(Clone, Debug, Default)]
pub struct Page {
    /// Messages in ascending `createdAt` order.
    pub messages: Vec<Message>,
    /// Whether older messages exist beyond this page.
    pub has_more: bool,
}

/// Latest message of one conversation.
#[derive(Clone, Debug)]
pub struct ConversationHead {
    /// The other party.
    pub counterpart_id: ContactId,
    /// Most recent message exchanged with them.
    pub last_message: Message,
}

/// Persistence operations the delivery service needs.
pub trait MessageStore: Send + Sync {
    /// Register `contact` for `account`, or refresh it.
    ///
    /// Returns `false` if the contact handle belongs to another account.
    fn claim_contact(
        &self,
        contact: &ContactId,
        account: &AccountId,
        device: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Whether `contact` has ever been claimed.
    fn contact_exists(&self, contact: &ContactId) -> Result<bool>;

    /// Persist a message, idempotent on `(sender, client_id)`.
    fn insert(&self, new: NewMessage, now: DateTime<Utc>) -> Result<Inserted>;

    /// Fetch by server id.
    fn get(&self, id: &MessageId) -> Result<Option<Message>>;

    /// Most recent `limit` messages between `owner` and `counterpart`.
    ///
    /// With `before`, only messages ordered strictly before that message by
    /// `(createdAt, id)` are considered, so messages sharing a millisecond
    /// with the cursor are neither skipped nor repeated.
    fn list_conversation(
        &self,
        owner: &ContactId,
        counterpart: &ContactId,
        limit: usize,
        before: Option<&MessageId>,
    ) -> Result<Page>;

    /// Advance a message's status, forward only.
    ///
    /// Returns the message after the update and whether it changed, or
    /// `None` if the id is unknown.
    fn advance_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> Result<Option<(Message, bool)>>;

    /// Latest message per counterpart for `owner`, most recent first.
    fn list_conversations(&self, owner: &ContactId) -> Result<Vec<ConversationHead>>;
}
