//! ActivityPub endpoints
//!
//! - Actor document
//! - Inbox (personal and shared)
//! - Outbox
//! - Followers/Following collections

use std::time::Duration;

use axum::body::Bytes;
use axum::{
    Json, Router,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::json;

use super::extract::ApiQuery;
use crate::AppState;
use crate::error::AppError;
use crate::federation::{
    ACTIVITY_JSON, AS_CONTEXT, ActivityEnvelope, OutboxPager, OutboxQuery, verify_request,
};
use crate::metrics::FEDERATION_REQUESTS_TOTAL;
use crate::service::AccountService;

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor document
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/outbox - Outbox
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:username/outbox", get(outbox))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
}

fn activity_json<T: Serialize>(body: T) -> Response {
    ([(header::CONTENT_TYPE, ACTIVITY_JSON)], Json(body)).into_response()
}

fn account_service(state: &AppState) -> AccountService {
    AccountService::new(state.config.clone(), state.db.clone(), state.key_vault.clone())
}

/// GET /users/:username
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let document = account_service(&state).actor_document(&username).await?;
    Ok(activity_json(document))
}

/// POST /users/:username/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    if state.db.get_local_actor(&username).await?.is_none() {
        return Err(AppError::NotFound(format!("actor {}", username)));
    }

    receive(&state, &uri, &headers, &body).await
}

/// POST /inbox
async fn shared_inbox(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, &uri, &headers, &body).await
}

/// Inbound delivery pipeline shared by both inboxes
///
/// # Steps
/// 1. Reject unsigned requests
/// 2. Decode the envelope and normalize its actor
/// 3. Verify the HTTP signature against the keyId owner's key
/// 4. Apply the activity
/// 5. Hand a pending `Accept` to the delivery worker
async fn receive(
    state: &AppState,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<StatusCode, AppError> {
    let result = async {
        if headers.get("signature").is_none() {
            return Err(AppError::Unauthorized);
        }

        let envelope = ActivityEnvelope::from_slice(body)?;
        envelope.actor.canonical_url()?;

        // The signature covers the request target exactly as the sender saw it.
        let target = uri
            .path_and_query()
            .map(|path_and_query| path_and_query.as_str())
            .unwrap_or_else(|| uri.path());
        let signer = verify_request(
            "POST",
            target,
            headers,
            body,
            &state.resolver,
            Duration::from_secs(state.config.federation.fetch_timeout_secs),
        )
        .await?;

        let outcome = state.inbox.process(&envelope, &signer).await?;
        if let Some(task) = outcome.accept {
            state.delivery.spawn_accept(task);
        }

        tracing::debug!(
            activity = %envelope.id,
            kind = %envelope.kind,
            signer = %signer,
            "Accepted inbound activity"
        );
        Ok(StatusCode::ACCEPTED)
    }
    .await;

    let status = match &result {
        Ok(status) => status.as_u16().to_string(),
        Err(error) => error.status_code().as_u16().to_string(),
    };
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbox", status.as_str()])
        .inc();

    result
}

/// GET /users/:username/outbox
///
/// Without a page query this is the collection summary; `page=true` with an
/// optional `max_id` or `min_id` selects a page.
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    ApiQuery(query): ApiQuery<OutboxQuery>,
) -> Result<Response, AppError> {
    let actor = account_service(&state).get(&username).await?;
    let actor_url = state.config.server.actor_url(&actor.username);
    let pager = OutboxPager::new(
        &state.db,
        &actor_url,
        state.config.federation.outbox_page_size,
    );

    let document = if query.is_page() {
        pager.page(query.cursor()?).await?
    } else {
        pager.summary().await?
    };

    Ok(activity_json(document))
}

fn ordered_collection(id: String, items: Vec<String>) -> serde_json::Value {
    json!({
        "@context": AS_CONTEXT,
        "id": id,
        "type": "OrderedCollection",
        "totalItems": items.len(),
        "orderedItems": items,
    })
}

/// GET /users/:username/followers
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let (actor_url, followers) = account_service(&state).followers(&username).await?;
    Ok(activity_json(ordered_collection(
        format!("{}/followers", actor_url),
        followers,
    )))
}

/// GET /users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let (actor_url, following) = account_service(&state).following(&username).await?;
    Ok(activity_json(ordered_collection(
        format!("{}/following", actor_url),
        following,
    )))
}
