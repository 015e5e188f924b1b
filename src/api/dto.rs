//! Data Transfer Objects for the internal content-service API
//!
//! Request bodies are deserialized straight from JSON; responses are built
//! from the stored records and never expose key material.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{FollowEdge, LikeEdge, LocalActor, Post};
use crate::federation::Actor;
use crate::service::RemoteNote;

// =============================================================================
// Actors
// =============================================================================

/// POST /internal/actors
#[derive(Debug, Clone, Deserialize)]
pub struct CreateActorRequest {
    pub username: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
}

/// A local actor as seen by the content service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorResponse {
    pub id: String,
    pub username: String,
    pub url: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub public_key_pem: String,
    pub created_at: DateTime<Utc>,
}

impl ActorResponse {
    pub fn from_local(actor: LocalActor, url: String) -> Self {
        Self {
            id: actor.id,
            username: actor.username,
            url,
            display_name: actor.display_name,
            summary: actor.summary,
            public_key_pem: actor.public_key_pem,
            created_at: actor.created_at,
        }
    }
}

/// GET /internal/external-actor
///
/// Either `username` and `domain`, or `url`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExternalActorQuery {
    pub username: Option<String>,
    pub domain: Option<String>,
    pub url: Option<String>,
}

/// Any resolved actor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalActorResponse {
    pub url: String,
    pub username: String,
    pub domain: Option<String>,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub inbox: String,
    pub outbox: Option<String>,
    pub key_id: String,
    pub local: bool,
}

impl From<Actor> for ExternalActorResponse {
    fn from(actor: Actor) -> Self {
        let url = actor.url().to_string();
        let inbox = actor.inbox();
        let outbox = actor.outbox();
        let key_id = actor.key_id();
        match actor {
            Actor::Local { actor, .. } => Self {
                url,
                username: actor.username,
                domain: None,
                display_name: actor.display_name,
                summary: actor.summary,
                inbox,
                outbox,
                key_id,
                local: true,
            },
            Actor::Remote(remote) => Self {
                url,
                username: remote.username,
                domain: Some(remote.domain),
                display_name: remote.display_name,
                summary: remote.summary,
                inbox,
                outbox,
                key_id,
                local: false,
            },
        }
    }
}

// =============================================================================
// Posts
// =============================================================================

/// POST /internal/posts
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePostRequest {
    pub username: String,
    pub content: String,
    pub in_reply_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostResponse {
    pub id: String,
    pub uri: String,
    pub actor: String,
    pub content: String,
    pub in_reply_to: Option<String>,
    pub federated: bool,
    pub published_at: DateTime<Utc>,
    /// Follower inboxes the `Create` was queued for
    pub queued_deliveries: usize,
}

impl PostResponse {
    pub fn new(post: Post, queued_deliveries: usize) -> Self {
        Self {
            id: post.id,
            uri: post.uri,
            actor: post.actor_uri,
            content: post.content,
            in_reply_to: post.in_reply_to_uri,
            federated: post.federated,
            published_at: post.published_at,
            queued_deliveries,
        }
    }
}

// =============================================================================
// Follows and likes
// =============================================================================

/// POST/DELETE /internal/follows
///
/// `target` is an actor URL or a `user@domain` handle.
#[derive(Debug, Clone, Deserialize)]
pub struct FollowRequest {
    pub username: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowResponse {
    pub actor: String,
    pub object: String,
    pub activity: String,
    pub accepted_at: Option<DateTime<Utc>>,
    /// `false` when the target is local and nothing was sent
    pub delivery_queued: bool,
}

impl FollowResponse {
    pub fn new(edge: FollowEdge, delivery_queued: bool) -> Self {
        Self {
            actor: edge.actor_uri,
            object: edge.object_uri,
            activity: edge.activity_uri,
            accepted_at: edge.accepted_at,
            delivery_queued,
        }
    }
}

/// POST/DELETE /internal/likes
#[derive(Debug, Clone, Deserialize)]
pub struct LikeRequest {
    pub username: String,
    /// URI of the liked post
    pub object: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LikeResponse {
    pub actor: String,
    pub object: String,
    pub activity: String,
    pub delivery_queued: bool,
}

impl LikeResponse {
    pub fn new(edge: LikeEdge, delivery_queued: bool) -> Self {
        Self {
            actor: edge.actor_uri,
            object: edge.object_uri,
            activity: edge.activity_uri,
            delivery_queued,
        }
    }
}

// =============================================================================
// Remote posts
// =============================================================================

/// GET /internal/remote-posts
#[derive(Debug, Clone, Deserialize)]
pub struct RemotePostsQuery {
    /// Actor URL or handle
    pub actor: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemotePostsResponse {
    pub actor: String,
    pub posts: Vec<RemoteNote>,
}
