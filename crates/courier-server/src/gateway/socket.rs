//! One WebSocket from upgrade to disconnect.
//!
//! The first frame must be `authenticate`. Until it arrives (or the auth
//! timeout fires) the socket is registered with the hub but receives no
//! broadcasts. After authentication the socket is bound to its session, any
//! older socket of the same session is replaced, and presence goes online.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use courier_core::events::{ClientEvent, ServerEvent, reasons};
use courier_core::{CourierError, Result, SocketId};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{Binding, ClientConnection};
use super::heartbeat::{HeartbeatOutcome, run_heartbeat};
use crate::metrics::{
    WS_AUTH_FAILURES_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::server::AppState;

/// Outbound frames buffered per socket before pushes start failing.
const OUTBOUND_CHANNEL_CAPACITY: usize = 1024;

/// How long the writer gets to flush a final frame on close.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Run a socket until it closes.
#[instrument(skip_all, fields(socket_id))]
pub async fn run_socket(ws: WebSocket, state: AppState) {
    let socket_id = SocketId::new();
    let _ = tracing::Span::current().record("socket_id", socket_id.as_str());

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(OUTBOUND_CHANNEL_CAPACITY);
    let conn = Arc::new(ClientConnection::new(socket_id.clone(), tx));
    state.hub.add(Arc::clone(&conn));
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    debug!("socket opened");

    let writer_conn = Arc::clone(&conn);
    let ping_every = state.config.heartbeat_interval;
    let writer = tokio::spawn(async move {
        let mut ping =
            tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
        loop {
            tokio::select! {
                biased;
                frame = rx.recv() => match frame {
                    Some(text) => {
                        if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                () = writer_conn.closed() => {
                    while let Ok(text) = rx.try_recv() {
                        if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let shutdown = state.shutdown.token();
    let reason = match authenticate(&mut ws_rx, &conn, &state).await {
        Ok(binding) => {
            let reason = serve(&mut ws_rx, &conn, &state, &binding, &shutdown).await;
            if state.registry.detach_socket(&binding.account_id, &socket_id) {
                state.presence.schedule_offline(binding.contact_id.clone());
            }
            reason
        }
        Err(err) => {
            counter!(WS_AUTH_FAILURES_TOTAL).increment(1);
            warn!(error = %err, "socket authentication failed");
            conn.close_with(&ServerEvent::AuthenticationFailed {
                error: err.to_string(),
            });
            "auth_failed"
        }
    };

    conn.close();
    state.hub.remove(&socket_id);
    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await.is_err() {
        debug!("writer did not finish flushing");
    }

    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(
        reason,
        age_ms = u64::try_from(conn.age().as_millis()).unwrap_or(u64::MAX),
        dropped = conn.drop_count(),
        "socket closed"
    );
}

/// Next text payload, skipping control frames. `None` once the peer is gone.
async fn next_text(
    ws_rx: &mut SplitStream<WebSocket>,
    conn: &ClientConnection,
) -> Option<String> {
    while let Some(Ok(msg)) = ws_rx.next().await {
        conn.mark_alive();
        match msg {
            Message::Text(text) => return Some(text.as_str().to_owned()),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => return Some(text),
                Err(_) => debug!(len = data.len(), "ignoring non-UTF8 binary frame"),
            },
            Message::Close(_) => return None,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    None
}

async fn authenticate(
    ws_rx: &mut SplitStream<WebSocket>,
    conn: &ClientConnection,
    state: &AppState,
) -> Result<Binding> {
    let first = tokio::time::timeout(state.config.auth_timeout, next_text(ws_rx, conn))
        .await
        .map_err(|_| CourierError::auth_invalid(reasons::AUTH_TIMEOUT))?
        .ok_or_else(|| CourierError::auth_invalid("socket closed before authenticating"))?;

    let (token, contact_id) = match serde_json::from_str::<ClientEvent>(&first) {
        Ok(ClientEvent::Authenticate { token, contact_id }) => (token, contact_id),
        Ok(other) => {
            return Err(CourierError::auth_invalid(format!(
                "expected authenticate, got {}",
                other.event_type()
            )));
        }
        Err(e) => return Err(CourierError::auth_invalid(format!("malformed frame: {e}"))),
    };

    let account_id = state.verifier.verify(&token).await?;
    let session = state.registry.validate(&account_id, &token)?;
    if session.contact_id != contact_id {
        return Err(CourierError::auth_invalid("contact does not match session"));
    }

    if let Some(previous) = state
        .registry
        .attach_socket(&account_id, &token, conn.id.clone())?
    {
        info!(previous = %previous, "replacing older connection");
        let _ = state.hub.close(
            &previous,
            &ServerEvent::ConnectionReplaced {
                reason: reasons::REPLACED.into(),
            },
        );
    }

    conn.bind(account_id.clone(), contact_id.clone());
    let _ = conn.send_event(&ServerEvent::Authenticated {
        contact_id: contact_id.clone(),
    });
    state.presence.set_online(&contact_id);
    info!(account_id = %account_id, contact_id = %contact_id, "socket authenticated");
    Ok(Binding {
        account_id,
        contact_id,
    })
}

async fn serve(
    ws_rx: &mut SplitStream<WebSocket>,
    conn: &Arc<ClientConnection>,
    state: &AppState,
    binding: &Binding,
    shutdown: &CancellationToken,
) -> &'static str {
    let heartbeat = {
        let conn = Arc::clone(conn);
        let registry = Arc::clone(&state.registry);
        let account_id = binding.account_id.clone();
        let interval = state.config.heartbeat_interval;
        let timeout = state.config.heartbeat_timeout;
        tokio::spawn(async move {
            let cancel = conn.close_token();
            let outcome = run_heartbeat(Arc::clone(&conn), interval, timeout, cancel, move || {
                let _ = registry.touch(&account_id);
            })
            .await;
            if outcome == HeartbeatOutcome::TimedOut {
                warn!(socket_id = %conn.id, "client unresponsive, closing");
                conn.close();
            }
            outcome
        })
    };

    let reason = loop {
        tokio::select! {
            text = next_text(ws_rx, conn) => {
                let Some(text) = text else { break "peer_closed" };
                handle_frame(&text, conn, state, binding);
            }
            () = conn.closed() => break "closed",
            () = shutdown.cancelled() => break "shutdown",
        }
    };

    conn.close();
    match heartbeat.await {
        Ok(HeartbeatOutcome::TimedOut) => "heartbeat_timeout",
        _ => reason,
    }
}

fn handle_frame(text: &str, conn: &ClientConnection, state: &AppState, binding: &Binding) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "ignoring malformed client frame");
            return;
        }
    };
    match event {
        ClientEvent::TypingStart { contact_id } => {
            let _ = state.presence.typing_start(&binding.contact_id, &contact_id);
        }
        ClientEvent::TypingStop { contact_id } => {
            let _ = state.presence.typing_stop(&binding.contact_id, &contact_id);
        }
        ClientEvent::Ping => {
            let _ = state.registry.touch(&binding.account_id);
            let _ = conn.send_event(&ServerEvent::Pong);
        }
        ClientEvent::Authenticate { .. } => {
            debug!("ignoring repeated authenticate");
        }
    }
}
