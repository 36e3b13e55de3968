//! `SQLite` implementation of [`MessageStore`].

use chrono::{DateTime, Utc};
use courier_core::{
    AccountId, ClientMessageId, ContactId, DeviceId, Message, MessageId, MessageKind,
    MessageStatus,
};
use rusqlite::{
    Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, ffi, params,
};
use tracing::{debug, instrument};

use super::connection::{self, ConnectionConfig, ConnectionPool};
use super::migrations::run_migrations;
use super::{ConversationHead, Inserted, MessageStore, NewMessage, Page, Result, StoreError};

const COLUMNS: &str = "id, client_id, sender_contact_id, recipient_contact_id, content, kind, created_at_ms, status";

/// Message store backed by an `r2d2` `SQLite` pool.
#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: ConnectionPool,
}

impl SqliteMessageStore {
    /// Open (or create) a file-backed store and apply migrations.
    pub fn open(path: &str) -> Result<Self> {
        Self::with_pool(connection::new_file(path, &ConnectionConfig::default())?)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        Self::with_pool(connection::new_in_memory(&ConnectionConfig::default())?)
    }

    fn with_pool(pool: ConnectionPool) -> Result<Self> {
        {
            let conn = pool.get()?;
            let _ = run_migrations(&conn)?;
        }
        Ok(Self { pool })
    }

    fn fetch(conn: &Connection, id: &MessageId) -> Result<Option<Message>> {
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"),
                params![id.as_str()],
                RawMessage::from_row,
            )
            .optional()?;
        raw.map(RawMessage::decode).transpose()
    }

    fn find_by_client_id(
        conn: &Connection,
        sender: &ContactId,
        client_id: &ClientMessageId,
    ) -> Result<Option<RawMessage>> {
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM messages WHERE sender_contact_id = ?1 AND client_id = ?2"
                ),
                params![sender.as_str(), client_id.as_str()],
                RawMessage::from_row,
            )
            .optional()?)
    }

    /// `(created_at_ms, id)` of `id`, provided it belongs to the conversation.
    fn cursor(
        conn: &Connection,
        owner: &ContactId,
        counterpart: &ContactId,
        id: &MessageId,
    ) -> Result<(i64, String)> {
        conn.query_row(
            "SELECT created_at_ms, id FROM messages
             WHERE id = ?1
               AND ((sender_contact_id = ?2 AND recipient_contact_id = ?3)
                 OR (sender_contact_id = ?3 AND recipient_contact_id = ?2))",
            params![id.as_str(), owner.as_str(), counterpart.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| StoreError::UnknownCursor(id.to_string()))
    }
}

/// Hand back the stored row for a replayed send, or refuse a reused client id.
fn replayed(raw: RawMessage, new: &NewMessage, client_id: &ClientMessageId) -> Result<Inserted> {
    let message = raw.decode()?;
    if message.content != new.content {
        return Err(StoreError::ClientIdConflict(client_id.to_string()));
    }
    debug!(client_id = %client_id, "send replayed, returning stored message");
    Ok(Inserted {
        message,
        created: false,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Undecoded `messages` row.
struct RawMessage {
    id: String,
    client_id: Option<String>,
    sender: String,
    recipient: String,
    content: String,
    kind: String,
    created_at_ms: i64,
    status: String,
}

impl RawMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            client_id: row.get(1)?,
            sender: row.get(2)?,
            recipient: row.get(3)?,
            content: row.get(4)?,
            kind: row.get(5)?,
            created_at_ms: row.get(6)?,
            status: row.get(7)?,
        })
    }

    fn decode(self) -> Result<Message> {
        let corrupt = |reason: String| StoreError::CorruptRow {
            table: "messages",
            reason,
        };
        let kind = MessageKind::parse(&self.kind)
            .ok_or_else(|| corrupt(format!("message {} has unknown kind {:?}", self.id, self.kind)))?;
        let status = MessageStatus::parse(&self.status).ok_or_else(|| {
            corrupt(format!("message {} has unknown status {:?}", self.id, self.status))
        })?;
        let created_at = DateTime::from_timestamp_millis(self.created_at_ms).ok_or_else(|| {
            corrupt(format!("message {} has invalid timestamp {}", self.id, self.created_at_ms))
        })?;
        Ok(Message {
            id: Some(MessageId::from(self.id)),
            client_id: self.client_id.map(ClientMessageId::from),
            sender_contact_id: ContactId::from(self.sender),
            recipient_contact_id: ContactId::from(self.recipient),
            content: self.content,
            kind,
            created_at,
            status,
        })
    }
}

fn collect(rows: impl Iterator<Item = rusqlite::Result<RawMessage>>) -> Result<Vec<Message>> {
    rows.map(|r| r.map_err(StoreError::from).and_then(RawMessage::decode))
        .collect()
}

impl MessageStore for SqliteMessageStore {
    fn claim_contact(
        &self,
        contact: &ContactId,
        account: &AccountId,
        device: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // The update only applies when the row already belongs to `account`,
        // so a zero row count means another account owns the handle.
        let changed = tx.execute(
            "INSERT INTO contacts (contact_id, account_id, device_id, last_login_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(contact_id) DO UPDATE
                SET device_id = excluded.device_id, last_login_at = excluded.last_login_at
              WHERE contacts.account_id = excluded.account_id",
            params![
                contact.as_str(),
                account.as_str(),
                device.as_str(),
                now.timestamp_millis()
            ],
        )?;
        tx.commit()?;
        if changed == 0 {
            debug!(contact = %contact, account = %account, "contact owned by another account");
        }
        Ok(changed > 0)
    }

    fn contact_exists(&self, contact: &ContactId) -> Result<bool> {
        let conn = self.pool.get()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM contacts WHERE contact_id = ?1",
                params![contact.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    #[instrument(skip_all, fields(sender = %new.sender, recipient = %new.recipient))]
    fn insert(&self, new: NewMessage, now: DateTime<Utc>) -> Result<Inserted> {
        let mut conn = self.pool.get()?;
        // IMMEDIATE takes the write lock up front; a deferred transaction
        // would fail with SQLITE_BUSY on the read-to-write upgrade.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(client_id) = &new.client_id {
            if let Some(raw) = Self::find_by_client_id(&tx, &new.sender, client_id)? {
                return replayed(raw, &new, client_id);
            }
        }

        let id = MessageId::new();
        let created_at_ms = now.timestamp_millis();
        let status = MessageStatus::Sent;
        let written = tx.execute(
            "INSERT INTO messages
               (id, client_id, sender_contact_id, recipient_contact_id, content, kind, created_at_ms, status, status_rank)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id.as_str(),
                new.client_id.as_ref().map(ClientMessageId::as_str),
                new.sender.as_str(),
                new.recipient.as_str(),
                new.content,
                new.kind.as_str(),
                created_at_ms,
                status.as_str(),
                i64::from(status.rank()),
            ],
        );
        if let Err(err) = written {
            drop(tx);
            if is_unique_violation(&err) {
                if let Some(client_id) = &new.client_id {
                    if let Some(raw) = Self::find_by_client_id(&conn, &new.sender, client_id)? {
                        return replayed(raw, &new, client_id);
                    }
                }
            }
            return Err(err.into());
        }
        tx.commit()?;

        Ok(Inserted {
            message: Message {
                id: Some(id),
                client_id: new.client_id,
                sender_contact_id: new.sender,
                recipient_contact_id: new.recipient,
                content: new.content,
                kind: new.kind,
                created_at: DateTime::from_timestamp_millis(created_at_ms).unwrap_or(now),
                status,
            },
            created: true,
        })
    }

    fn get(&self, id: &MessageId) -> Result<Option<Message>> {
        let conn = self.pool.get()?;
        Self::fetch(&conn, id)
    }

    fn list_conversation(
        &self,
        owner: &ContactId,
        counterpart: &ContactId,
        limit: usize,
        before: Option<&MessageId>,
    ) -> Result<Page> {
        let conn = self.pool.get()?;
        let (before_ms, before_id) = match before {
            Some(id) => {
                let (ms, id) = Self::cursor(&conn, owner, counterpart, id)?;
                (Some(ms), Some(id))
            }
            None => (None, None),
        };
        let fetch = i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM messages
             WHERE ((sender_contact_id = ?1 AND recipient_contact_id = ?2)
                 OR (sender_contact_id = ?2 AND recipient_contact_id = ?1))
               AND (?3 IS NULL
                 OR created_at_ms < ?3
                 OR (created_at_ms = ?3 AND id < ?4))
             ORDER BY created_at_ms DESC, id DESC
             LIMIT ?5"
        ))?;
        let rows = stmt.query_map(
            params![owner.as_str(), counterpart.as_str(), before_ms, before_id, fetch],
            RawMessage::from_row,
        )?;
        let mut messages = collect(rows)?;
        let has_more = messages.len() > limit;
        messages.truncate(limit);
        messages.reverse();
        Ok(Page { messages, has_more })
    }

    fn advance_status(
        &self,
        id: &MessageId,
        status: MessageStatus,
    ) -> Result<Option<(Message, bool)>> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE messages SET status = ?2, status_rank = ?3 WHERE id = ?1 AND status_rank < ?3",
            params![id.as_str(), status.as_str(), i64::from(status.rank())],
        )? > 0;
        Ok(Self::fetch(&conn, id)?.map(|m| (m, changed)))
    }

    fn list_conversations(&self, owner: &ContactId) -> Result<Vec<ConversationHead>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM (
               SELECT *, ROW_NUMBER() OVER (
                 PARTITION BY CASE WHEN sender_contact_id = ?1 THEN recipient_contact_id ELSE sender_contact_id END
                 ORDER BY created_at_ms DESC, id DESC
               ) AS rn
               FROM messages
               WHERE sender_contact_id = ?1 OR recipient_contact_id = ?1
             )
             WHERE rn = 1
             ORDER BY created_at_ms DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![owner.as_str()], RawMessage::from_row)?;
        Ok(collect(rows)?
            .into_iter()
            .map(|m| ConversationHead {
                counterpart_id: m.counterpart(owner).clone(),
                last_message: m,
            })
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
