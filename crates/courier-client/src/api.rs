//! HTTP seam to the server.
//!
//! [`ChatApi`] is what the delivery pipeline and the client façade talk to;
//! [`HttpChatApi`] is the reqwest implementation. The adapter owns the
//! bearer credential: `login` stores it, `logout` forgets it.

use std::time::Duration;

use async_trait::async_trait;
use courier_core::wire::{
    ConversationEntry, ConversationsResponse, LoginRequest, LoginResponse, MeResponse,
    MessagesResponse, PresenceResponse, ReceiptResponse, SendRequest, SendResponse,
};
use courier_core::{ContactId, CourierError, ErrorBody, MessageId, Result};
use parking_lot::RwLock;
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Server operations the client depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Exchange an identity token for a session. Replaces any other login.
    async fn login(&self, request: LoginRequest) -> Result<LoginResponse>;
    /// End the session.
    async fn logout(&self) -> Result<()>;
    /// Current session.
    async fn me(&self) -> Result<MeResponse>;
    /// Submit a message.
    async fn send(&self, request: SendRequest) -> Result<SendResponse>;
    /// A page of the conversation with `counterpart`: the latest one, or
    /// the one just older than message `before`.
    async fn fetch_messages(
        &self,
        counterpart: &ContactId,
        limit: Option<usize>,
        before: Option<MessageId>,
    ) -> Result<MessagesResponse>;
    /// Latest message of each conversation.
    async fn list_conversations(&self) -> Result<Vec<ConversationEntry>>;
    /// Acknowledge receipt.
    async fn mark_delivered(&self, id: &MessageId) -> Result<ReceiptResponse>;
    /// Acknowledge reading.
    async fn mark_read(&self, id: &MessageId) -> Result<ReceiptResponse>;
    /// Point-in-time presence.
    async fn presence(&self, contact: &ContactId) -> Result<bool>;
}

/// Parse a `Retry-After` header value (delta-seconds) into milliseconds.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().map(|s| s.saturating_mul(1000))
}

/// reqwest-backed [`ChatApi`].
pub struct HttpChatApi {
    base_url: String,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl HttpChatApi {
    /// Build an adapter for `base_url` with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CourierError::internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client,
            token: RwLock::new(None),
        })
    }

    /// Current bearer token, if logged in.
    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// Use `token` for subsequent requests.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write() = token;
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authed(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let token = self
            .token()
            .ok_or_else(|| CourierError::auth_invalid("not logged in"))?;
        Ok(builder.bearer_auth(token))
    }

    async fn execute(builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await.map_err(transport_error)?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(error_from_response(response).await)
    }

    async fn json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T> {
        Self::execute(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| CourierError::DeliveryRejected(format!("malformed response: {e}")))
    }
}

fn transport_error(err: reqwest::Error) -> CourierError {
    debug!(error = %err, "request failed in transport");
    CourierError::DeliveryTimeout(err.to_string())
}

async fn error_from_response(response: Response) -> CourierError {
    let status = response.status();
    let retry_header = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.json::<ErrorBody>().await.ok();

    match status {
        StatusCode::UNAUTHORIZED => {
            let message = body.map_or_else(|| "unauthorized".to_owned(), |b| b.message);
            CourierError::AuthInvalid(message)
        }
        StatusCode::TOO_MANY_REQUESTS => CourierError::RateLimited {
            retry_after_ms: retry_header
                .or_else(|| body.and_then(|b| b.retry_after_ms))
                .unwrap_or(1_000),
        },
        _ => match body {
            Some(body) => body.into_error(),
            None => {
                warn!(status = status.as_u16(), "error response without body");
                CourierError::DeliveryRejected(format!("server returned {status}"))
            }
        },
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn login(&self, request: LoginRequest) -> Result<LoginResponse> {
        let token = request.id_token.clone();
        let response: LoginResponse =
            Self::json(self.client.post(self.url("/auth/login")).json(&request)).await?;
        self.set_token(Some(token));
        Ok(response)
    }

    async fn logout(&self) -> Result<()> {
        let result = Self::execute(self.authed(self.client.post(self.url("/auth/logout")))?).await;
        self.set_token(None);
        result.map(|_| ())
    }

    async fn me(&self) -> Result<MeResponse> {
        Self::json(self.authed(self.client.get(self.url("/auth/me")))?).await
    }

    async fn send(&self, request: SendRequest) -> Result<SendResponse> {
        Self::json(self.authed(self.client.post(self.url("/chat/send")))?.json(&request)).await
    }

    async fn fetch_messages(
        &self,
        counterpart: &ContactId,
        limit: Option<usize>,
        before: Option<MessageId>,
    ) -> Result<MessagesResponse> {
        let mut builder = self
            .client
            .get(self.url(&format!("/chat/{counterpart}/messages")));
        if let Some(limit) = limit {
            builder = builder.query(&[("limit", limit)]);
        }
        if let Some(before) = before {
            builder = builder.query(&[("before", before.as_str())]);
        }
        Self::json(self.authed(builder)?).await
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationEntry>> {
        let body: ConversationsResponse =
            Self::json(self.authed(self.client.get(self.url("/chat/conversations")))?).await?;
        Ok(body.conversations)
    }

    async fn mark_delivered(&self, id: &MessageId) -> Result<ReceiptResponse> {
        Self::json(self.authed(self.client.post(self.url(&format!("/chat/delivered/{id}"))))?)
            .await
    }

    async fn mark_read(&self, id: &MessageId) -> Result<ReceiptResponse> {
        Self::json(self.authed(self.client.post(self.url(&format!("/chat/read/{id}"))))?).await
    }

    async fn presence(&self, contact: &ContactId) -> Result<bool> {
        let body: PresenceResponse =
            Self::json(self.authed(self.client.get(self.url(&format!("/presence/{contact}"))))?)
                .await?;
        Ok(body.online)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use courier_core::MessageStatus;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> HttpChatApi {
        HttpChatApi::new(server.uri(), Duration::from_secs(5)).unwrap()
    }

    fn logged_in(server: &MockServer) -> HttpChatApi {
        let api = api(server);
        api.set_token(Some("tok".into()));
        api
    }

    #[tokio::test]
    async fn login_stores_token_for_later_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .and(body_json(json!({"idToken": "tok", "contactId": "alice", "deviceId": "d1"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"accountId": "u1", "contactId": "alice"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/presence/bob"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"contactId": "bob", "online": true})),
            )
            .mount(&server)
            .await;

        let api = api(&server);
        let resp = api
            .login(LoginRequest {
                id_token: "tok".into(),
                contact_id: "alice".into(),
                device_id: "d1".into(),
            })
            .await
            .unwrap();
        assert_eq!(resp.account_id.as_str(), "u1");
        assert!(api.presence(&"bob".into()).await.unwrap());
    }

    #[tokio::test]
    async fn requests_without_login_fail_locally() {
        let server = MockServer::start().await;
        let api = api(&server);
        assert_matches!(api.me().await, Err(CourierError::AuthInvalid(_)));
    }

    #[tokio::test]
    async fn send_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/send"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messageId": "m1",
                "status": "sent",
                "recipientOnline": true,
                "createdAt": "2024-05-01T10:00:00Z"
            })))
            .mount(&server)
            .await;
        let resp = logged_in(&server)
            .send(SendRequest {
                recipient_contact_id: "bob".into(),
                content: "hi".into(),
                client_id: Some("c1".into()),
            })
            .await
            .unwrap();
        assert_eq!(resp.message_id.as_str(), "m1");
        assert_eq!(resp.status, MessageStatus::Sent);
        assert!(resp.recipient_online);
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/me"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "code": "AUTH_INVALID",
                "message": "not the active session"
            })))
            .mount(&server)
            .await;
        assert_matches!(
            logged_in(&server).me().await,
            Err(CourierError::AuthInvalid(m)) if m.contains("active session")
        );
    }

    #[tokio::test]
    async fn too_many_requests_prefers_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/conversations"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "3")
                    .set_body_json(json!({
                        "code": "RATE_LIMITED",
                        "message": "slow down",
                        "retryAfterMs": 2500
                    })),
            )
            .mount(&server)
            .await;
        assert_matches!(
            logged_in(&server).list_conversations().await,
            Err(CourierError::RateLimited { retry_after_ms: 3_000 })
        );
    }

    #[tokio::test]
    async fn rejection_keeps_server_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/send"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "code": "DELIVERY_REJECTED",
                "message": "client id reused"
            })))
            .mount(&server)
            .await;
        let err = logged_in(&server)
            .send(SendRequest {
                recipient_contact_id: "bob".into(),
                content: "hi".into(),
                client_id: None,
            })
            .await
            .unwrap_err();
        assert_matches!(err, CourierError::DeliveryRejected(_));
    }

    #[tokio::test]
    async fn bare_server_error_is_rejected_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/read/m1"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        assert_matches!(
            logged_in(&server).mark_read(&"m1".into()).await,
            Err(CourierError::DeliveryRejected(_))
        );
    }

    #[tokio::test]
    async fn fetch_passes_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/bob/messages"))
            .and(query_param("limit", "25"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"messages": [], "hasMore": false})),
            )
            .mount(&server)
            .await;
        let page = logged_in(&server)
            .fetch_messages(&"bob".into(), Some(25), None)
            .await
            .unwrap();
        assert!(page.messages.is_empty());
    }

    #[tokio::test]
    async fn fetch_passes_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chat/bob/messages"))
            .and(query_param("before", "m10"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"messages": [], "hasMore": false})),
            )
            .expect(1)
            .mount(&server)
            .await;
        let page = logged_in(&server)
            .fetch_messages(&"bob".into(), None, Some("m10".into()))
            .await
            .unwrap();
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn unreachable_server_is_delivery_timeout() {
        let api = HttpChatApi::new("http://127.0.0.1:1", Duration::from_millis(500)).unwrap();
        api.set_token(Some("tok".into()));
        assert_matches!(api.me().await, Err(CourierError::DeliveryTimeout(_)));
    }

    #[test]
    fn retry_after_parses_seconds() {
        assert_eq!(parse_retry_after("2"), Some(2_000));
        assert_eq!(parse_retry_after(" 10 "), Some(10_000));
        assert_eq!(parse_retry_after("soon"), None);
    }
}
