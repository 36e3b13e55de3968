//! Duplicate detection and forward-only merge.
//!
//! Two observations describe the same logical message when their server ids
//! match, or when their client ids match, the content is identical, and the
//! creation times fall within a small tolerance window. The window absorbs
//! the gap between the optimistic local timestamp and the server-assigned one
//! when a retried send had in fact already succeeded.

use chrono::TimeDelta;

use crate::message::Message;

/// Default tolerance between local and server creation times.
pub const DEFAULT_TOLERANCE: TimeDelta = TimeDelta::seconds(120);

/// Duplicate-detection policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DedupPolicy {
    /// Maximum `createdAt` distance for a client-id match.
    pub tolerance: TimeDelta,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl DedupPolicy {
    /// Policy with a tolerance expressed in milliseconds.
    pub fn from_millis(ms: u64) -> Self {
        let ms = i64::try_from(ms).unwrap_or(i64::MAX);
        Self {
            tolerance: TimeDelta::try_milliseconds(ms).unwrap_or(DEFAULT_TOLERANCE),
        }
    }

    /// Whether `a` and `b` are the same logical message.
    pub fn is_duplicate(&self, a: &Message, b: &Message) -> bool {
        if let (Some(x), Some(y)) = (&a.id, &b.id) {
            if x == y {
                return true;
            }
        }
        match (&a.client_id, &b.client_id) {
            (Some(x), Some(y)) if x == y => {
                a.content == b.content && (a.created_at - b.created_at).abs() <= self.tolerance
            }
            _ => false,
        }
    }

    /// Index of the first entry in `existing` that duplicates `incoming`.
    pub fn find(&self, existing: &[Message], incoming: &Message) -> Option<usize> {
        existing.iter().position(|m| self.is_duplicate(m, incoming))
    }
}

/// Fold `incoming` into `existing`, which describe the same message.
///
/// The server's view wins for identity and timestamp once it has assigned an
/// id; the client id is never lost; status advances forward only. Returns
/// `true` if anything changed.
pub fn merge_into(existing: &mut Message, incoming: &Message) -> bool {
    let before = existing.clone();

    if incoming.id.is_some() && existing.id.is_none() {
        existing.id.clone_from(&incoming.id);
        existing.created_at = incoming.created_at;
    } else if incoming.id.is_some() && incoming.id == existing.id {
        existing.created_at = incoming.created_at;
    }
    if existing.client_id.is_none() {
        existing.client_id.clone_from(&incoming.client_id);
    }
    existing.status = existing.status.merge(incoming.status);

    *existing != before
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
