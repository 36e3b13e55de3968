//! Real-time channel events.
//!
//! Every frame is a JSON object `{"type": "<snake_case>", "data": {...}}`;
//! payload-less events (`ping`, `pong`) carry only the `type`.

use serde::{Deserialize, Serialize};

use crate::ids::{ContactId, MessageId};
use crate::message::{Message, MessageStatus};

/// Reasons attached to `session_invalidated` / `connection_replaced`.
pub mod reasons {
    /// Another device logged in to the same account.
    pub const SUPERSEDED: &str = "superseded";
    /// The session was idle past the inactivity timeout.
    pub const EXPIRED: &str = "expired";
    /// The account logged out explicitly.
    pub const LOGGED_OUT: &str = "logged_out";
    /// A newer connection for the same session took over.
    pub const REPLACED: &str = "replaced";
    /// No `authenticate` arrived in time.
    pub const AUTH_TIMEOUT: &str = "authentication timed out";
}

/// Events sent by a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// First frame on a new socket.
    #[serde(rename_all = "camelCase")]
    Authenticate {
        /// Bearer token of the session.
        token: String,
        /// Contact handle the socket speaks for.
        contact_id: ContactId,
    },
    /// The user started typing to `contact_id`.
    #[serde(rename_all = "camelCase")]
    TypingStart {
        /// Target of the typing indicator.
        contact_id: ContactId,
    },
    /// The user stopped typing to `contact_id`.
    #[serde(rename_all = "camelCase")]
    TypingStop {
        /// Target of the typing indicator.
        contact_id: ContactId,
    },
    /// Application-level liveness probe.
    Ping,
}

/// Events sent by the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// The handshake succeeded.
    #[serde(rename_all = "camelCase")]
    Authenticated {
        /// Contact the socket is bound to.
        contact_id: ContactId,
    },
    /// The handshake failed; the socket closes next.
    AuthenticationFailed {
        /// Human-readable cause.
        error: String,
    },
    /// The session behind this socket is gone; the socket closes next.
    SessionInvalidated {
        /// Why the session ended.
        reason: String,
    },
    /// A newer socket took over this session; this one closes next.
    ConnectionReplaced {
        /// Why the socket was replaced.
        reason: String,
    },
    /// A message addressed to this contact.
    NewMessage(Message),
    /// A receipt changed the status of a message this contact sent.
    #[serde(rename = "message_status", rename_all = "camelCase")]
    StatusChanged {
        /// Server id of the message.
        message_id: MessageId,
        /// New status.
        status: MessageStatus,
        /// Contact that issued the receipt.
        contact_id: ContactId,
    },
    /// A contact came online.
    #[serde(rename_all = "camelCase")]
    UserOnline {
        /// The contact.
        contact_id: ContactId,
    },
    /// A contact went offline.
    #[serde(rename_all = "camelCase")]
    UserOffline {
        /// The contact.
        contact_id: ContactId,
    },
    /// `contact_id` is typing to this contact.
    #[serde(rename_all = "camelCase")]
    TypingStart {
        /// The typist.
        contact_id: ContactId,
    },
    /// `contact_id` stopped typing to this contact.
    #[serde(rename_all = "camelCase")]
    TypingStop {
        /// The typist.
        contact_id: ContactId,
    },
    /// Reply to [`ClientEvent::Ping`].
    Pong,
}

impl ClientEvent {
    /// Wire `type` of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::Ping => "ping",
        }
    }
}

impl ServerEvent {
    /// Wire `type` of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Authenticated { .. } => "authenticated",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::SessionInvalidated { .. } => "session_invalidated",
            Self::ConnectionReplaced { .. } => "connection_replaced",
            Self::NewMessage(_) => "new_message",
            Self::StatusChanged { .. } => "message_status",
            Self::UserOnline { .. } => "user_online",
            Self::UserOffline { .. } => "user_offline",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::Pong => "pong",
        }
    }

    /// Whether the server closes the socket right after sending this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed { .. }
                | Self::SessionInvalidated { .. }
                | Self::ConnectionReplaced { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn authenticate_wire_shape() {
        let ev: ClientEvent = serde_json::from_value(json!({
            "type": "authenticate",
            "data": {"token": "t1", "contactId": "alice"}
        }))
        .unwrap();
        assert_eq!(
            ev,
            ClientEvent::Authenticate {
                token: "t1".into(),
                contact_id: "alice".into()
            }
        );
    }

    #[test]
    fn ping_has_no_data() {
        let ev: ClientEvent = serde_json::from_value(json!({"type": "ping"})).unwrap();
        assert_eq!(ev, ClientEvent::Ping);
        let out = serde_json::to_value(&ServerEvent::Pong).unwrap();
        assert_eq!(out, json!({"type": "pong"}));
    }

    #[test]
    fn typing_events_use_camel_case() {
        let out = serde_json::to_value(&ServerEvent::TypingStart {
            contact_id: "bob".into(),
        })
        .unwrap();
        assert_eq!(out, json!({"type": "typing_start", "data": {"contactId": "bob"}}));
    }

    #[test]
    fn status_changed_is_message_status_on_the_wire() {
        let ev = ServerEvent::StatusChanged {
            message_id: "m1".into(),
            status: MessageStatus::Read,
            contact_id: "bob".into(),
        };
        let out = serde_json::to_value(&ev).unwrap();
        assert_eq!(out["type"], "message_status");
        assert_eq!(out["data"]["messageId"], "m1");
        assert_eq!(out["data"]["status"], "read");
        assert_eq!(ev.event_type(), "message_status");
    }

    #[test]
    fn terminal_events() {
        assert!(ServerEvent::SessionInvalidated { reason: reasons::SUPERSEDED.into() }.is_terminal());
        assert!(ServerEvent::ConnectionReplaced { reason: reasons::REPLACED.into() }.is_terminal());
        assert!(ServerEvent::AuthenticationFailed { error: "x".into() }.is_terminal());
        assert!(!ServerEvent::Pong.is_terminal());
    }

    #[test]
    fn event_type_matches_serialized_tag() {
        let events = vec![
            ServerEvent::Authenticated { contact_id: "a".into() },
            ServerEvent::UserOffline { contact_id: "a".into() },
            ServerEvent::SessionInvalidated { reason: "r".into() },
            ServerEvent::Pong,
        ];
        for ev in events {
            let out = serde_json::to_value(&ev).unwrap();
            assert_eq!(out["type"], ev.event_type());
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let res = serde_json::from_value::<ClientEvent>(json!({"type": "shout", "data": {}}));
        assert!(res.is_err());
    }
}
