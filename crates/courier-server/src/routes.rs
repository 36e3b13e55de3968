//! HTTP surface.

use std::sync::Arc;

use axum::Json;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use courier_core::events::{ServerEvent, reasons};
use courier_core::validation::validate_identifier;
use courier_core::wire::{
    ConversationEntry, ConversationsResponse, LoginRequest, LoginResponse, MeResponse,
    MessagesResponse, PresenceResponse, ReceiptResponse, SendRequest, SendResponse,
};
use courier_core::{ContactId, CourierError, MessageId};
use metrics::{counter, gauge};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::auth::AuthSession;
use crate::errors::{ApiError, ApiResult};
use crate::gateway::socket::run_socket;
use crate::health::HealthReport;
use crate::metrics::{SESSIONS_ACTIVE, SESSIONS_CREATED_TOTAL, SESSIONS_SUPERSEDED_TOTAL};
use crate::server::AppState;

/// `GET /chat/{counterpartId}/messages` query.
#[derive(Debug, Default, Deserialize)]
pub struct MessagesQuery {
    /// Page size.
    pub limit: Option<usize>,
    /// Id of the oldest message already held; the page ends just before it.
    pub before: Option<MessageId>,
}

/// Build the router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
        .route("/chat/send", post(send))
        .route("/chat/conversations", get(conversations))
        .route("/chat/{counterpart_id}/messages", get(messages))
        .route("/chat/delivered/{message_id}", post(delivered))
        .route("/chat/read/{message_id}", post(read))
        .route("/presence/{contact_id}", get(presence))
        .with_state(state)
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport::capture(&state))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if state.hub.connection_count() >= state.config.max_connections {
        warn!(
            max_connections = state.config.max_connections,
            "refusing socket, connection limit reached"
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_socket(socket, state))
}

/// POST /auth/login
#[instrument(skip_all)]
async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    validate_identifier("contactId", &req.contact_id)?;
    validate_identifier("deviceId", &req.device_id)?;
    let account_id = state.verifier.verify(&req.id_token).await?;

    let claimed = {
        let store = Arc::clone(state.delivery.store());
        let contact = req.contact_id.clone();
        let account = account_id.clone();
        let device = req.device_id.clone();
        let now = state.clock.now();
        tokio::task::spawn_blocking(move || store.claim_contact(&contact, &account, &device, now))
            .await
            .map_err(|e| CourierError::internal(format!("store task failed: {e}")))?
            .map_err(CourierError::from)?
    };
    if !claimed {
        return Err(CourierError::Forbidden(format!(
            "contact {} belongs to another account",
            req.contact_id
        ))
        .into());
    }

    let created = state.registry.create_session(
        account_id.clone(),
        &req.id_token,
        req.contact_id.clone(),
        req.device_id,
    );
    counter!(SESSIONS_CREATED_TOTAL).increment(1);
    #[allow(clippy::cast_precision_loss)]
    gauge!(SESSIONS_ACTIVE).set(state.registry.active_count() as f64);

    if let Some(old) = created.superseded {
        counter!(SESSIONS_SUPERSEDED_TOTAL).increment(1);
        if let Some(socket) = &old.socket_id {
            let _ = state.hub.close(
                socket,
                &ServerEvent::SessionInvalidated {
                    reason: reasons::SUPERSEDED.into(),
                },
            );
            state.presence.schedule_offline(old.contact_id.clone());
        }
        info!(account_id = %account_id, old_device = %old.device_id, "previous session superseded");
    }
    info!(account_id = %account_id, contact_id = %req.contact_id, "logged in");

    Ok(Json(LoginResponse {
        account_id,
        contact_id: req.contact_id,
    }))
}

/// POST /auth/logout
async fn logout(State(state): State<AppState>, auth: AuthSession) -> StatusCode {
    if let Some(session) = state.registry.destroy(&auth.session.account_id) {
        if let Some(socket) = &session.socket_id {
            let _ = state.hub.close(
                socket,
                &ServerEvent::SessionInvalidated {
                    reason: reasons::LOGGED_OUT.into(),
                },
            );
            state.presence.schedule_offline(session.contact_id.clone());
        }
        info!(account_id = %session.account_id, "logged out");
    }
    #[allow(clippy::cast_precision_loss)]
    gauge!(SESSIONS_ACTIVE).set(state.registry.active_count() as f64);
    StatusCode::OK
}

/// GET /auth/me
async fn me(State(state): State<AppState>, auth: AuthSession) -> Json<MeResponse> {
    let session = state
        .registry
        .session(&auth.session.account_id)
        .unwrap_or(auth.session);
    Json(MeResponse {
        connected: session.socket_id.is_some(),
        account_id: session.account_id,
        contact_id: session.contact_id,
        device_id: session.device_id,
        created_at: session.created_at,
        last_activity_at: session.last_activity_at,
    })
}

/// POST /chat/send
async fn send(
    State(state): State<AppState>,
    auth: AuthSession,
    Json(req): Json<SendRequest>,
) -> ApiResult<Json<SendResponse>> {
    let outcome = state
        .delivery
        .send(
            &auth.session.contact_id,
            &req.recipient_contact_id,
            &req.content,
            req.client_id,
        )
        .await?;
    let message_id = outcome
        .message
        .id
        .ok_or_else(|| ApiError(CourierError::internal("stored message has no id")))?;
    Ok(Json(SendResponse {
        message_id,
        status: outcome.message.status,
        recipient_online: outcome.recipient_online,
        created_at: outcome.message.created_at,
    }))
}

/// GET /chat/conversations
async fn conversations(
    State(state): State<AppState>,
    auth: AuthSession,
) -> ApiResult<Json<ConversationsResponse>> {
    let heads = state
        .delivery
        .list_conversations(&auth.session.contact_id)
        .await?;
    Ok(Json(ConversationsResponse {
        conversations: heads
            .into_iter()
            .map(|h| ConversationEntry {
                counterpart_id: h.counterpart_id,
                last_message: h.last_message,
            })
            .collect(),
    }))
}

/// GET /chat/{counterpartId}/messages
async fn messages(
    State(state): State<AppState>,
    auth: AuthSession,
    Path(counterpart_id): Path<ContactId>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<MessagesResponse>> {
    let page = state
        .delivery
        .list_messages(
            &auth.session.contact_id,
            &counterpart_id,
            query.limit,
            query.before,
        )
        .await?;
    Ok(Json(MessagesResponse {
        messages: page.messages,
        has_more: page.has_more,
    }))
}

/// POST /chat/delivered/{messageId}
async fn delivered(
    State(state): State<AppState>,
    auth: AuthSession,
    Path(message_id): Path<MessageId>,
) -> ApiResult<Json<ReceiptResponse>> {
    let message = state
        .delivery
        .mark_delivered(&auth.session.contact_id, &message_id)
        .await?;
    Ok(Json(ReceiptResponse {
        message_id,
        status: message.status,
    }))
}

/// POST /chat/read/{messageId}
async fn read(
    State(state): State<AppState>,
    auth: AuthSession,
    Path(message_id): Path<MessageId>,
) -> ApiResult<Json<ReceiptResponse>> {
    let message = state
        .delivery
        .mark_read(&auth.session.contact_id, &message_id)
        .await?;
    Ok(Json(ReceiptResponse {
        message_id,
        status: message.status,
    }))
}

/// GET /presence/{contactId}
async fn presence(
    State(state): State<AppState>,
    _auth: AuthSession,
    Path(contact_id): Path<ContactId>,
) -> Json<PresenceResponse> {
    let online = state.registry.is_online(&contact_id);
    Json(PresenceResponse { contact_id, online })
}
