//! Live socket index and event fan-out.

use std::sync::Arc;

use courier_core::events::ServerEvent;
use courier_core::{ContactId, SocketId};
use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, warn};

use super::connection::ClientConnection;
use crate::metrics::WS_DROPPED_FRAMES_TOTAL;

/// Every open socket, authenticated or not.
#[derive(Default)]
pub struct ConnectionHub {
    connections: DashMap<SocketId, Arc<ClientConnection>>,
}

impl ConnectionHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket.
    pub fn add(&self, connection: Arc<ClientConnection>) {
        let _ = self.connections.insert(connection.id.clone(), connection);
    }

    /// Unregister a socket.
    pub fn remove(&self, id: &SocketId) {
        let _ = self.connections.remove(id);
    }

    /// Look up a socket.
    pub fn get(&self, id: &SocketId) -> Option<Arc<ClientConnection>> {
        self.connections.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Send an event to one socket. Returns `false` if it is gone or full.
    pub fn send_to(&self, id: &SocketId, event: &ServerEvent) -> bool {
        let Some(conn) = self.get(id) else {
            debug!(socket_id = %id, event_type = event.event_type(), "socket gone, event not pushed");
            return false;
        };
        let sent = conn.send_event(event);
        if !sent {
            counter!(WS_DROPPED_FRAMES_TOTAL).increment(1);
            warn!(socket_id = %id, event_type = event.event_type(), "failed to push event");
        }
        sent
    }

    /// Send an event to every authenticated socket except `exclude`'s.
    ///
    /// Returns how many sockets accepted it.
    pub fn broadcast_except(&self, exclude: &ContactId, event: &ServerEvent) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(event_type = event.event_type(), error = %e, "failed to serialize event");
                return 0;
            }
        };
        let mut delivered = 0;
        for entry in &self.connections {
            let conn = entry.value();
            match conn.contact_id() {
                Some(contact) if &contact != exclude => {
                    if conn.send(Arc::clone(&json)) {
                        delivered += 1;
                    } else {
                        counter!(WS_DROPPED_FRAMES_TOTAL).increment(1);
                    }
                }
                _ => {}
            }
        }
        debug!(event_type = event.event_type(), delivered, "broadcast event");
        delivered
    }

    /// Send a terminal event to a socket and close it.
    pub fn close(&self, id: &SocketId, event: &ServerEvent) -> bool {
        match self.get(id) {
            Some(conn) => {
                debug!(socket_id = %id, event_type = event.event_type(), "closing socket");
                conn.close_with(event);
                true
            }
            None => false,
        }
    }

    /// Close every socket (server shutdown).
    pub fn close_all(&self) {
        for entry in &self.connections {
            entry.value().close();
        }
    }

    /// Number of open sockets.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
