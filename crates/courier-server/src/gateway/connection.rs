//! Per-socket connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use courier_core::events::ServerEvent;
use courier_core::{AccountId, ContactId, SocketId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;

/// Who an authenticated socket speaks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    /// Account subject.
    pub account_id: AccountId,
    /// Contact handle.
    pub contact_id: ContactId,
}

/// One live WebSocket.
pub struct ClientConnection {
    /// Unique socket ID.
    pub id: SocketId,
    binding: Mutex<Option<Binding>>,
    tx: mpsc::Sender<Arc<String>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has shown activity since the last heartbeat tick.
    pub is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    /// Count of frames dropped due to a full channel.
    pub dropped_messages: AtomicU64,
    closing: CancellationToken,
}

impl ClientConnection {
    /// Create a new, unauthenticated connection.
    pub fn new(id: SocketId, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            binding: Mutex::new(None),
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            closing: CancellationToken::new(),
        }
    }

    /// Bind this socket to an authenticated session.
    pub fn bind(&self, account_id: AccountId, contact_id: ContactId) {
        *self.binding.lock() = Some(Binding {
            account_id,
            contact_id,
        });
    }

    /// Current binding, if authenticated.
    pub fn binding(&self) -> Option<Binding> {
        self.binding.lock().clone()
    }

    /// Contact handle, if authenticated.
    pub fn contact_id(&self) -> Option<ContactId> {
        self.binding.lock().as_ref().map(|b| b.contact_id.clone())
    }

    /// Queue a text frame.
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize and queue an event.
    pub fn send_event(&self, event: &ServerEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                warn!(socket_id = %self.id, event_type = event.event_type(), error = %e, "failed to serialize event");
                false
            }
        }
    }

    /// Queue a final event, then close the socket once it is flushed.
    pub fn close_with(&self, event: &ServerEvent) {
        let _ = self.send_event(event);
        self.close();
    }

    /// Close the socket.
    pub fn close(&self) {
        self.closing.cancel();
    }

    /// Whether a close was requested.
    pub fn is_closing(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Resolves once a close is requested.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closing.cancelled()
    }

    /// Token cancelled when the socket closes, for child tasks.
    pub fn close_token(&self) -> CancellationToken {
        self.closing.clone()
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Time since the last inbound activity.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Check and reset the alive flag.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection() -> (ClientConnection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(32);
        (ClientConnection::new("sock_1".into(), tx), rx)
    }

    #[test]
    fn new_connection_is_unbound() {
        let (conn, _rx) = make_connection();
        assert_eq!(conn.id.as_str(), "sock_1");
        assert!(conn.binding().is_none());
        assert!(conn.is_alive.load(Ordering::Relaxed));
        assert!(!conn.is_closing());
    }

    #[test]
    fn bind_sets_contact() {
        let (conn, _rx) = make_connection();
        conn.bind("u1".into(), "alice".into());
        assert_eq!(conn.contact_id().unwrap().as_str(), "alice");
        assert_eq!(conn.binding().unwrap().account_id.as_str(), "u1");
    }

    #[tokio::test]
    async fn send_event_serializes() {
        let (conn, mut rx) = make_connection();
        assert!(conn.send_event(&ServerEvent::Pong));
        let frame = rx.recv().await.unwrap();
        assert_eq!(&*frame, r#"{"type":"pong"}"#);
    }

    #[tokio::test]
    async fn full_channel_counts_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ClientConnection::new("sock_2".into(), tx);
        assert!(conn.send(Arc::new("a".into())));
        assert!(!conn.send(Arc::new("b".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn close_with_queues_event_then_closes() {
        let (conn, mut rx) = make_connection();
        conn.close_with(&ServerEvent::ConnectionReplaced {
            reason: "replaced".into(),
        });
        assert!(conn.is_closing());
        conn.closed().await;
        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("connection_replaced"));
    }

    #[test]
    fn check_alive_resets() {
        let (conn, _rx) = make_connection();
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }
}
