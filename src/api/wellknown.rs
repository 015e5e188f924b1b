//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use super::extract::ApiQuery;
use crate::AppState;
use crate::error::AppError;
use crate::federation::{JRD_JSON, generate_webfinger_response, parse_acct_resource};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: Option<String>,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain
///
/// A domain other than ours is a 400; an unknown handle is a 404.
async fn webfinger(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<WebFingerQuery>,
) -> Result<Response, AppError> {
    let resource = query
        .resource
        .ok_or_else(|| AppError::Validation("resource parameter is required".to_string()))?;
    let (username, domain) = parse_acct_resource(&resource)?;

    if !state.config.server.is_local_domain(&domain) {
        return Err(AppError::Validation(format!(
            "{} is not served by this server",
            domain
        )));
    }

    let actor = state
        .db
        .get_local_actor(&username)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("actor {}", username)))?;

    let actor_url = state.config.server.actor_url(&actor.username);
    let jrd = generate_webfinger_response(&actor.username, &state.config.server.domain, &actor_url);

    Ok(([(header::CONTENT_TYPE, JRD_JSON)], axum::Json(jrd)).into_response())
}
