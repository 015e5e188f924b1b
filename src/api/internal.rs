//! Internal content-service API
//!
//! Everything under `/internal` is called by the content service on behalf
//! of local users and requires a service token.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
};

use super::dto::{
    ActorResponse, CreateActorRequest, CreatePostRequest, ExternalActorQuery,
    ExternalActorResponse, FollowRequest, FollowResponse, LikeRequest, LikeResponse,
    PostResponse, RemotePostsQuery, RemotePostsResponse,
};
use super::extract::{ApiJson, ApiQuery};
use crate::AppState;
use crate::auth::require_service_token;
use crate::error::AppError;
use crate::service::{AccountService, InteractionService, PostService};

/// Create internal router
///
/// Routes:
/// - POST /internal/actors
/// - GET /internal/actors/:username
/// - GET /internal/external-actor
/// - POST /internal/posts
/// - POST, DELETE /internal/follows
/// - POST, DELETE /internal/likes
/// - GET /internal/remote-posts
pub fn internal_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/internal/actors", post(create_actor))
        .route("/internal/actors/:username", get(get_actor))
        .route("/internal/external-actor", get(external_actor))
        .route("/internal/posts", post(create_post))
        .route("/internal/follows", post(follow).delete(unfollow))
        .route("/internal/likes", post(like).delete(unlike))
        .route("/internal/remote-posts", get(remote_posts))
        .route_layer(middleware::from_fn_with_state(state, require_service_token))
}

fn account_service(state: &AppState) -> AccountService {
    AccountService::new(state.config.clone(), state.db.clone(), state.key_vault.clone())
}

fn interaction_service(state: &AppState) -> InteractionService {
    InteractionService::new(
        state.config.clone(),
        state.db.clone(),
        state.resolver.clone(),
        state.delivery.clone(),
    )
}

/// POST /internal/actors
///
/// Activates a local actor and provisions its key pair.
async fn create_actor(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateActorRequest>,
) -> Result<(StatusCode, Json<ActorResponse>), AppError> {
    let actor = account_service(&state)
        .activate(&request.username, request.display_name, request.summary)
        .await?;
    let url = state.config.server.actor_url(&actor.username);

    Ok((
        StatusCode::CREATED,
        Json(ActorResponse::from_local(actor, url)),
    ))
}

/// GET /internal/actors/:username
async fn get_actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<ActorResponse>, AppError> {
    let actor = account_service(&state).get(&username).await?;
    let url = state.config.server.actor_url(&actor.username);
    Ok(Json(ActorResponse::from_local(actor, url)))
}

/// GET /internal/external-actor?username=&domain= or ?url=
async fn external_actor(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ExternalActorQuery>,
) -> Result<Json<ExternalActorResponse>, AppError> {
    let actor = match (query.url, query.username, query.domain) {
        (Some(url), None, None) => state.resolver.resolve_url(&url).await?,
        (None, Some(username), Some(domain)) => {
            state
                .resolver
                .resolve_handle(&username, Some(domain.as_str()))
                .await?
        }
        _ => {
            return Err(AppError::Validation(
                "either url, or username and domain, is required".to_string(),
            ));
        }
    };

    Ok(Json(ExternalActorResponse::from(actor)))
}

/// POST /internal/posts
async fn create_post(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreatePostRequest>,
) -> Result<(StatusCode, Json<PostResponse>), AppError> {
    let service = PostService::new(state.config.clone(), state.db.clone(), state.delivery.clone());
    let published = service
        .create(&request.username, &request.content, request.in_reply_to)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(PostResponse::new(published.post, published.queued_deliveries)),
    ))
}

/// POST /internal/follows
async fn follow(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<FollowRequest>,
) -> Result<(StatusCode, Json<FollowResponse>), AppError> {
    let interaction = interaction_service(&state)
        .follow(&request.username, &request.target)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(FollowResponse::new(interaction.record, interaction.delivery_queued)),
    ))
}

/// DELETE /internal/follows
async fn unfollow(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<FollowRequest>,
) -> Result<Json<FollowResponse>, AppError> {
    let interaction = interaction_service(&state)
        .unfollow(&request.username, &request.target)
        .await?;
    Ok(Json(FollowResponse::new(
        interaction.record,
        interaction.delivery_queued,
    )))
}

/// POST /internal/likes
async fn like(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<LikeRequest>,
) -> Result<(StatusCode, Json<LikeResponse>), AppError> {
    let interaction = interaction_service(&state)
        .like(&request.username, &request.object)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(LikeResponse::new(interaction.record, interaction.delivery_queued)),
    ))
}

/// DELETE /internal/likes
async fn unlike(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<LikeRequest>,
) -> Result<Json<LikeResponse>, AppError> {
    let interaction = interaction_service(&state)
        .unlike(&request.username, &request.object)
        .await?;
    Ok(Json(LikeResponse::new(
        interaction.record,
        interaction.delivery_queued,
    )))
}

/// GET /internal/remote-posts?actor=
async fn remote_posts(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<RemotePostsQuery>,
) -> Result<Json<RemotePostsResponse>, AppError> {
    let posts = interaction_service(&state)
        .actor_posts(&query.actor)
        .await?;
    Ok(Json(RemotePostsResponse {
        actor: query.actor,
        posts,
    }))
}
