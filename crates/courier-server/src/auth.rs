//! Bearer-token authentication for HTTP routes.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use courier_core::CourierError;

use crate::errors::ApiError;
use crate::registry::Session;
use crate::server::AppState;

/// The caller's active session, extracted from `Authorization: Bearer`.
///
/// Rejects with `AUTH_INVALID` unless the token verifies and is the
/// account's current session credential. Successful extraction counts as
/// session activity and spends one rate-limit token.
#[derive(Clone, Debug)]
pub struct AuthSession {
    /// Session snapshot at validation time.
    pub session: Session,
    /// The presented bearer token.
    pub token: String,
}

/// Extract the bearer token from request headers.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

impl FromRequestParts<AppState> for AuthSession {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| CourierError::auth_invalid("missing bearer token"))?
            .to_owned();
        let account_id = state.verifier.verify(&token).await?;
        let session = state.registry.validate(&account_id, &token)?;
        if let Some(limiter) = &state.rate_limiter {
            limiter.check(&account_id)?;
        }
        let _ = state.registry.touch(&account_id);
        Ok(Self { session, token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        let _ = h.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn extracts_bearer() {
        assert_eq!(bearer_token(&headers("Bearer abc.def")), Some("abc.def"));
        assert_eq!(bearer_token(&headers("bearer  abc ")), Some("abc"));
    }

    #[test]
    fn rejects_other_schemes_and_empty() {
        assert_eq!(bearer_token(&headers("Basic dXNlcg==")), None);
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
