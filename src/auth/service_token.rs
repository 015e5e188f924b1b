//! Inter-service trust token
//!
//! Short-lived HS256 JWTs carried as `Authorization: Bearer <token>`
//! between the federation gateway and the content service. Tokens carry
//! no user identity; possession of a valid token means "the other half
//! of this deployment".

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Issuer claim of every service token
pub const TOKEN_ISSUER: &str = "federation-gateway";
/// Audience claim of every service token
pub const TOKEN_AUDIENCE: &str = "content-service";

/// Registered claims of a service token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceClaims {
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issue a token valid for `ttl_secs` seconds
pub fn issue_token(secret: &str, ttl_secs: u64) -> Result<String, AppError> {
    let now = Utc::now().timestamp();
    let ttl = i64::try_from(ttl_secs)
        .map_err(|_| AppError::Config("token ttl out of range".to_string()))?;
    let claims = ServiceClaims {
        iss: TOKEN_ISSUER.to_string(),
        aud: TOKEN_AUDIENCE.to_string(),
        iat: now,
        exp: now + ttl,
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Encryption(format!("failed to sign service token: {e}")))
}

/// Decode and validate a bare token
///
/// Checks signature, expiry (no leeway), issuer and audience.
pub fn verify_token(secret: &str, token: &str) -> Result<ServiceClaims, AppError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.set_issuer(&[TOKEN_ISSUER]);
    validation.set_audience(&[TOKEN_AUDIENCE]);
    validation.set_required_spec_claims(&["exp", "iss", "aud"]);

    jsonwebtoken::decode::<ServiceClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|error| {
        tracing::debug!(%error, "Service token rejected");
        AppError::Unauthorized
    })
}

/// Whether an `Authorization` header value carries a valid bearer token
pub fn authenticate(secret: &str, authorization: Option<&str>) -> bool {
    authorization
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .is_some_and(|token| verify_token(secret, token).is_ok())
}
