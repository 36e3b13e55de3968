//! Derived per-conversation summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ContactId;
use crate::message::{Message, MessageStatus};

/// One row of the conversation list, derived from message data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    /// The other party of the conversation.
    pub counterpart_id: ContactId,
    /// Display name from the contact cache, or the contact id.
    pub display_name: String,
    /// Body of the most recent message.
    pub last_message: String,
    /// Creation time of the most recent message.
    pub last_message_at: DateTime<Utc>,
    /// Incoming messages the owner has not read.
    pub unread_count: u32,
    /// Point-in-time presence of the counterpart.
    pub online: bool,
}

/// Fold one conversation's messages into a summary.
///
/// Returns `None` for an empty conversation.
pub fn summarize(
    owner: &ContactId,
    counterpart: &ContactId,
    messages: &[Message],
    display_name: Option<&str>,
    online: bool,
) -> Option<ChatSummary> {
    let latest = messages.iter().max_by_key(|m| m.created_at)?;
    let unread = messages
        .iter()
        .filter(|m| m.is_incoming_for(owner) && m.status != MessageStatus::Read)
        .count();

    Some(ChatSummary {
        counterpart_id: counterpart.clone(),
        display_name: display_name.map_or_else(|| counterpart.to_string(), str::to_owned),
        last_message: latest.content.clone(),
        last_message_at: latest.created_at,
        unread_count: u32::try_from(unread).unwrap_or(u32::MAX),
        online,
    })
}

/// Order summaries most recent first.
pub fn sort_by_recency(summaries: &mut [ChatSummary]) {
    summaries.sort_by(|a, b| {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then_with(|| a.counterpart_id.cmp(&b.counterpart_id))
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
