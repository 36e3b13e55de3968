//! Key/value persistence under the cache.
//!
//! Keys follow a fixed layout:
//!
//! | Key | Payload |
//! |---|---|
//! | `contacts` | array of contacts |
//! | `profile` | the logged-in profile |
//! | `chat:<counterpartId>:messages` | array of messages, oldest first |
//! | `chat:<counterpartId>:summary` | last derived summary |
//! | `cache:<key>` | `{storedAt, ttlMs, payload}` envelope |

use chrono::{DateTime, TimeDelta, Utc};
use courier_core::ContactId;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use super::Result;

/// Key of the contact list.
pub const CONTACTS: &str = "contacts";
/// Key of the profile.
pub const PROFILE: &str = "profile";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    key        TEXT PRIMARY KEY,
    payload    TEXT NOT NULL,
    updated_ms INTEGER NOT NULL
);";

/// Key of a chat's message list.
pub fn chat_messages(counterpart: &ContactId) -> String {
    format!("chat:{counterpart}:messages")
}

/// Key of a chat's cached summary.
pub fn chat_summary(counterpart: &ContactId) -> String {
    format!("chat:{counterpart}:summary")
}

/// Key of a generic TTL entry.
pub fn cache(key: &str) -> String {
    format!("cache:{key}")
}

/// What a stored key refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordKey {
    /// `contacts`
    Contacts,
    /// `profile`
    Profile,
    /// `chat:<id>:messages`
    ChatMessages(ContactId),
    /// `chat:<id>:summary`
    ChatSummary(ContactId),
    /// `cache:<key>`
    Cache(String),
}

impl RecordKey {
    /// Classify a raw key. `None` for anything outside the layout.
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            CONTACTS => return Some(Self::Contacts),
            PROFILE => return Some(Self::Profile),
            _ => {}
        }
        if let Some(rest) = key.strip_prefix("cache:") {
            return Some(Self::Cache(rest.to_owned()));
        }
        let rest = key.strip_prefix("chat:")?;
        if let Some(id) = rest.strip_suffix(":messages") {
            return (!id.is_empty()).then(|| Self::ChatMessages(id.into()));
        }
        if let Some(id) = rest.strip_suffix(":summary") {
            return (!id.is_empty()).then(|| Self::ChatSummary(id.into()));
        }
        None
    }
}

/// Stored wrapper around a `cache:` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEnvelope {
    /// When the payload was written.
    pub stored_at: DateTime<Utc>,
    /// Freshness window.
    pub ttl_ms: i64,
    /// The cached value.
    pub payload: serde_json::Value,
}

impl CacheEnvelope {
    /// Whether the entry is past its TTL at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let ttl = TimeDelta::try_milliseconds(self.ttl_ms).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.stored_at) > ttl
    }
}

/// The `records` table.
pub struct RecordDb {
    conn: Connection,
}

impl RecordDb {
    /// Open (or create) a file-backed table.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::init(conn)
    }

    /// In-memory table for tests.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Raw payload of `key`.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT payload FROM records WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Write `payload` under `key`.
    pub fn put(&self, key: &str, payload: &str) -> Result<()> {
        let _ = self.conn.execute(
            "INSERT INTO records (key, payload, updated_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, updated_ms = excluded.updated_ms",
            params![key, payload, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Serialize and write `value`.
    pub fn put_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.put(key, &serde_json::to_string(value)?)
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        Ok(self
            .conn
            .execute("DELETE FROM records WHERE key = ?1", params![key])?
            > 0)
    }

    /// Every `(key, payload)` pair, ordered by key.
    pub fn all(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, payload FROM records ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Remove everything.
    pub fn clear(&self) -> Result<()> {
        let _ = self.conn.execute("DELETE FROM records", [])?;
        Ok(())
    }
}
