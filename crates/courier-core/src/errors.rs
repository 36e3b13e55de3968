//! Error taxonomy shared by server and client.
//!
//! Every variant has a stable machine-readable code that travels on the wire
//! inside an [`ErrorBody`], so the client can rebuild the same variant from an
//! HTTP error response.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire error codes.
pub mod codes {
    /// Missing, expired, or mismatched token.
    pub const AUTH_INVALID: &str = "AUTH_INVALID";
    /// Another device took over the session.
    pub const SESSION_SUPERSEDED: &str = "SESSION_SUPERSEDED";
    /// The send did not complete in time.
    pub const DELIVERY_TIMEOUT: &str = "DELIVERY_TIMEOUT";
    /// The server refused the send.
    pub const DELIVERY_REJECTED: &str = "DELIVERY_REJECTED";
    /// A stored record failed structural validation.
    pub const STORAGE_CORRUPT: &str = "STORAGE_CORRUPT";
    /// Too many requests in the current window.
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    /// Input failed validation before any network call.
    pub const VALIDATION: &str = "VALIDATION";
    /// Entity does not exist.
    pub const NOT_FOUND: &str = "NOT_FOUND";
    /// Caller is authenticated but not allowed to act on the entity.
    pub const FORBIDDEN: &str = "FORBIDDEN";
    /// Unexpected failure.
    pub const INTERNAL: &str = "INTERNAL";
}

/// Top-level error type for courier.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CourierError {
    /// Missing, expired, or mismatched credential. Forces a re-login.
    #[error("authentication invalid: {0}")]
    AuthInvalid(String),

    /// Another device logged in; this session is gone.
    #[error("session superseded by another login")]
    SessionSuperseded,

    /// The network call did not complete in time.
    #[error("delivery timed out: {0}")]
    DeliveryTimeout(String),

    /// The server rejected the request.
    #[error("delivery rejected: {0}")]
    DeliveryRejected(String),

    /// A cached record failed structural validation.
    #[error("corrupt record {key}: {reason}")]
    StorageCorrupt {
        /// Storage key of the record.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Too many requests; retry after the hint.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Suggested wait before retrying.
        retry_after_ms: u64,
    },

    /// Input rejected before any network call.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller may not act on this entity.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CourierError {
    /// Machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthInvalid(_) => codes::AUTH_INVALID,
            Self::SessionSuperseded => codes::SESSION_SUPERSEDED,
            Self::DeliveryTimeout(_) => codes::DELIVERY_TIMEOUT,
            Self::DeliveryRejected(_) => codes::DELIVERY_REJECTED,
            Self::StorageCorrupt { .. } => codes::STORAGE_CORRUPT,
            Self::RateLimited { .. } => codes::RATE_LIMITED,
            Self::Validation(_) => codes::VALIDATION,
            Self::NotFound(_) => codes::NOT_FOUND,
            Self::Forbidden(_) => codes::FORBIDDEN,
            Self::Internal(_) => codes::INTERNAL,
        }
    }

    /// Transport-level failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeliveryTimeout(_) | Self::RateLimited { .. })
    }

    /// Authorization failures. Never retried with the same token.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthInvalid(_) | Self::SessionSuperseded)
    }

    /// Whether the UI should learn about this error.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::StorageCorrupt { .. })
    }

    /// Convenience constructor for [`CourierError::AuthInvalid`].
    pub fn auth_invalid(reason: impl Into<String>) -> Self {
        Self::AuthInvalid(reason.into())
    }

    /// Convenience constructor for [`CourierError::Validation`].
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    /// Convenience constructor for [`CourierError::Internal`].
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }
}

/// Result alias for courier operations.
pub type Result<T> = std::result::Result<T, CourierError>;

/// JSON error body returned by the HTTP surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Retry hint for rate-limited requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&CourierError> for ErrorBody {
    fn from(err: &CourierError) -> Self {
        let retry_after_ms = match err {
            CourierError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retry_after_ms,
        }
    }
}

impl ErrorBody {
    /// Rebuild the error variant this body was produced from.
    pub fn into_error(self) -> CourierError {
        match self.code.as_str() {
            codes::AUTH_INVALID => CourierError::AuthInvalid(self.message),
            codes::SESSION_SUPERSEDED => CourierError::SessionSuperseded,
            codes::DELIVERY_TIMEOUT => CourierError::DeliveryTimeout(self.message),
            codes::STORAGE_CORRUPT => CourierError::StorageCorrupt {
                key: String::new(),
                reason: self.message,
            },
            codes::RATE_LIMITED => CourierError::RateLimited {
                retry_after_ms: self.retry_after_ms.unwrap_or(1_000),
            },
            codes::VALIDATION => CourierError::Validation(self.message),
            codes::NOT_FOUND => CourierError::NotFound(self.message),
            codes::FORBIDDEN => CourierError::Forbidden(self.message),
            codes::INTERNAL => CourierError::Internal(self.message),
            _ => CourierError::DeliveryRejected(self.message),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
