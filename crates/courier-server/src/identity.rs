//! Identity-provider token verification.
//!
//! The bearer token clients present is the identity provider's token. The
//! server verifies it to learn the account subject, then checks with the
//! Session Registry that the same token is the account's current credential.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{AccountId, CourierError, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Resolves an identity token to its account subject.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify `id_token` and return the account it belongs to.
    async fn verify(&self, id_token: &str) -> Result<AccountId>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    iat: i64,
    #[serde(default)]
    jti: String,
}

/// HS256 JWT verifier sharing a secret with the identity provider.
pub struct JwtIdentityVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl JwtIdentityVerifier {
    /// Build a verifier for tokens signed with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            decoding: DecodingKey::from_secret(secret),
            encoding: EncodingKey::from_secret(secret),
            validation,
        }
    }

    /// Mint a token for `account_id` valid until `expires_at`.
    ///
    /// Used by local tooling and tests standing in for the identity provider.
    pub fn issue(&self, account_id: &AccountId, expires_at: DateTime<Utc>) -> Result<String> {
        let claims = Claims {
            sub: account_id.to_string(),
            exp: expires_at.timestamp(),
            iat: Utc::now().timestamp(),
            jti: uuid::Uuid::now_v7().to_string(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| CourierError::internal(format!("failed to sign token: {e}")))
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityVerifier {
    async fn verify(&self, id_token: &str) -> Result<AccountId> {
        let data = jsonwebtoken::decode::<Claims>(id_token, &self.decoding, &self.validation)
            .map_err(|e| {
                debug!(error = %e, "identity token rejected");
                CourierError::auth_invalid("identity token rejected")
            })?;
        if data.claims.sub.is_empty() {
            return Err(CourierError::auth_invalid("identity token has no subject"));
        }
        Ok(AccountId::from(data.claims.sub))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
