//! HTTP mapping for [`CourierError`].

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use courier_core::{CourierError, ErrorBody};
use tracing::{error, warn};

/// A [`CourierError`] on its way out of an HTTP handler.
#[derive(Debug)]
pub struct ApiError(pub CourierError);

impl From<CourierError> for ApiError {
    fn from(err: CourierError) -> Self {
        Self(err)
    }
}

/// Handler result.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Status code for an error kind.
pub fn status_for(err: &CourierError) -> StatusCode {
    match err {
        CourierError::AuthInvalid(_) | CourierError::SessionSuperseded => StatusCode::UNAUTHORIZED,
        CourierError::Forbidden(_) => StatusCode::FORBIDDEN,
        CourierError::Validation(_) => StatusCode::BAD_REQUEST,
        CourierError::NotFound(_) => StatusCode::NOT_FOUND,
        CourierError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        CourierError::DeliveryRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CourierError::DeliveryTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CourierError::StorageCorrupt { .. } | CourierError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "request failed");
        } else {
            warn!(code = self.0.code(), error = %self.0, "request rejected");
        }

        let body = match &self.0 {
            // Internal detail stays in the log.
            CourierError::Internal(_) | CourierError::StorageCorrupt { .. } => ErrorBody {
                code: self.0.code().to_owned(),
                message: "internal error".into(),
                retry_after_ms: None,
            },
            other => ErrorBody::from(other),
        };

        let mut response = (status, Json(body)).into_response();
        if let CourierError::RateLimited { retry_after_ms } = self.0 {
            let secs = retry_after_ms.div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                let _ = response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_for(&CourierError::auth_invalid("x")), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&CourierError::SessionSuperseded), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&CourierError::Forbidden("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&CourierError::validation("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&CourierError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&CourierError::DeliveryRejected("x".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&CourierError::internal("x")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() {
        let resp = ApiError(CourierError::RateLimited { retry_after_ms: 1_500 }).into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "2");
        let body = body_json(resp).await;
        assert_eq!(body["code"], "RATE_LIMITED");
        assert_eq!(body["retryAfterMs"], 1_500);
    }

    #[tokio::test]
    async fn internal_detail_is_hidden() {
        let resp = ApiError(CourierError::internal("disk on fire at /var/db")).into_response();
        let body = body_json(resp).await;
        assert_eq!(body["code"], "INTERNAL");
        assert_eq!(body["message"], "internal error");
    }

    #[tokio::test]
    async fn validation_message_is_returned() {
        let resp = ApiError(CourierError::validation("content must not be empty")).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["code"], "VALIDATION");
        assert!(body["message"].as_str().unwrap().contains("empty"));
    }
}
