//! Device-local cache of contacts, chats, and message history.
//!
//! [`ReconciliationStore`] keeps the working set in memory and writes every
//! change through to a small `SQLite` key/value table ([`records`]). Remote
//! snapshots, pushes, and the pipeline's own optimistic writes all land here
//! through the same duplicate-aware merge.

pub mod records;
mod reconcile;

pub use reconcile::{LoadReport, MergeOutcome, ReconciliationStore, StoreOptions};

use courier_core::{AccountId, ContactId, CourierError, DeviceId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the local cache.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A value could not be encoded.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// No message matched.
    #[error("no local message {0}")]
    UnknownMessage(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for CourierError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownMessage(id) => Self::NotFound(format!("message {id}")),
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Display info for a contact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Stable handle.
    pub contact_id: ContactId,
    /// Name shown in the chat list.
    pub display_name: String,
}

/// The logged-in user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Identity-provider subject.
    pub account_id: AccountId,
    /// Own contact handle.
    pub contact_id: ContactId,
    /// This device.
    pub device_id: DeviceId,
}
