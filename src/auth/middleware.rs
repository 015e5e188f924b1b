//! Authentication middleware
//!
//! Protects the internal content-service surface.

use axum::{
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::Response,
};

use super::service_token::authenticate;
use crate::AppState;
use crate::error::AppError;

/// Middleware to require a valid service token
///
/// Runs before any handler; a missing, malformed, expired or foreign
/// token is rejected with 401.
///
/// # Usage
/// ```ignore
/// let internal_routes = Router::new()
///     .route("/internal/...", ...)
///     .layer(middleware::from_fn_with_state(state, require_service_token));
/// ```
pub async fn require_service_token(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if !authenticate(&state.config.internal.service_secret, authorization) {
        return Err(AppError::Unauthorized);
    }

    Ok(next.run(request).await)
}
