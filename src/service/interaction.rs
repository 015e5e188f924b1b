//! Interaction service
//!
//! Follows and likes initiated by local actors, plus cross-server reads.
//! Local state is written first; the matching activity is then queued for
//! the remote party and delivered in the background. A failed delivery is
//! logged, never undone.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::AppConfig;
use crate::data::{Database, EntityId, FollowEdge, LikeEdge, OutboxCursor};
use crate::error::AppError;
use crate::federation::{
    ACTIVITY_JSON, Actor, ActorResolver, ActivityDelivery, LD_JSON_PROFILE, LocalSigner, builder,
    create_activity, fetch_remote_outbox, object_id,
};

/// A local write and whether an activity was queued for the remote side
///
/// Nothing is queued when the other party lives on this server.
#[derive(Debug, Clone, Serialize)]
pub struct Interaction<T> {
    pub record: T,
    pub delivery_queued: bool,
}

/// Note read from another server's outbox
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteNote {
    pub id: String,
    pub attributed_to: Option<String>,
    pub content: String,
    pub published: Option<String>,
    pub in_reply_to: Option<String>,
}

impl RemoteNote {
    fn from_item(item: &Value) -> Option<Self> {
        let note = match item.get("type").and_then(Value::as_str) {
            Some("Create") => item.get("object").filter(|object| object.is_object())?,
            Some("Note") => item,
            _ => return None,
        };
        if note.get("type").and_then(Value::as_str) != Some("Note") {
            return None;
        }

        Some(Self {
            id: object_id(note)?,
            attributed_to: note.get("attributedTo").and_then(object_id),
            content: ammonia::clean(note.get("content").and_then(Value::as_str).unwrap_or_default()),
            published: note.get("published").and_then(Value::as_str).map(str::to_string),
            in_reply_to: note.get("inReplyTo").and_then(object_id),
        })
    }
}

/// Interaction service
#[derive(Clone)]
pub struct InteractionService {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    resolver: Arc<ActorResolver>,
    delivery: Arc<ActivityDelivery>,
}

impl InteractionService {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        resolver: Arc<ActorResolver>,
        delivery: Arc<ActivityDelivery>,
    ) -> Self {
        Self {
            config,
            db,
            resolver,
            delivery,
        }
    }

    async fn signer(&self, username: &str) -> Result<LocalSigner, AppError> {
        let actor = self
            .db
            .get_local_actor(username)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("actor {}", username)))?;
        Ok(LocalSigner::new(
            &self.config.server.actor_url(&actor.username),
            &actor,
        ))
    }

    fn is_local_url(&self, actor_url: &str) -> bool {
        url::Url::parse(actor_url)
            .ok()
            .and_then(|url| crate::federation::authority_of(&url))
            .is_some_and(|authority| self.config.server.is_local_domain(&authority))
    }

    /// Queue one activity for `target` unless it is local
    fn queue(&self, signer: &LocalSigner, target: &Actor, activity: Value) -> bool {
        if target.is_local() {
            return false;
        }
        self.delivery
            .spawn_to_inbox(signer.clone(), target.inbox(), activity);
        true
    }

    /// Queue `activity` for the author of the remote post at `post_uri`
    ///
    /// Finding the author may mean fetching the post, so that happens in the
    /// background task too.
    fn queue_for_post_author(&self, signer: LocalSigner, post_uri: String, activity: Value) {
        let this = self.clone();
        tokio::spawn(async move {
            let result = match this.post_author(&post_uri).await {
                Ok(author_url) => {
                    this.delivery
                        .deliver_to_actor(&signer, &author_url, &activity)
                        .await
                }
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                tracing::warn!(post = %post_uri, %error, "Could not deliver to post author");
            }
        });
    }

    /// `username` follows `target` (URL or handle)
    ///
    /// # Errors
    /// `Conflict` if the follow already exists
    pub async fn follow(
        &self,
        username: &str,
        target: &str,
    ) -> Result<Interaction<FollowEdge>, AppError> {
        let signer = self.signer(username).await?;
        let target = self.resolver.resolve(target).await?;
        if target.url() == signer.actor_url {
            return Err(AppError::Validation("an actor cannot follow itself".to_string()));
        }

        let edge = FollowEdge {
            id: EntityId::new().0,
            actor_uri: signer.actor_url.clone(),
            object_uri: target.url().to_string(),
            activity_uri: signer.activity_id("follow"),
            accepted_at: None,
            created_at: chrono::Utc::now(),
        };
        self.db.insert_follow(&edge).await?;

        let activity = builder::follow(&edge.activity_uri, &edge.actor_uri, &edge.object_uri);
        let delivery_queued = self.queue(&signer, &target, activity);

        tracing::info!(
            follower = %edge.actor_uri,
            target = %edge.object_uri,
            delivery_queued,
            "Stored local follow"
        );
        Ok(Interaction {
            record: edge,
            delivery_queued,
        })
    }

    /// Remove a follow and send `Undo{Follow}`
    ///
    /// # Errors
    /// `Gone` if there was no such follow
    pub async fn unfollow(
        &self,
        username: &str,
        target: &str,
    ) -> Result<Interaction<FollowEdge>, AppError> {
        let signer = self.signer(username).await?;
        let target = self.resolver.resolve(target).await?;

        let edge = self
            .db
            .delete_follow(&signer.actor_url, target.url())
            .await?
            .ok_or_else(|| AppError::Gone("follow not found".to_string()))?;

        let follow = builder::follow(&edge.activity_uri, &edge.actor_uri, &edge.object_uri);
        let undo = builder::undo(&signer.activity_id("undo"), &signer.actor_url, follow);
        let delivery_queued = self.queue(&signer, &target, undo);

        tracing::info!(
            follower = %edge.actor_uri,
            target = %edge.object_uri,
            delivery_queued,
            "Removed local follow"
        );
        Ok(Interaction {
            record: edge,
            delivery_queued,
        })
    }

    /// Author URL of the remote post at `post_uri`
    ///
    /// Stored copies answer directly; anything else is fetched and read from
    /// its `attributedTo`. Never called for URLs on this server.
    async fn post_author(&self, post_uri: &str) -> Result<String, AppError> {
        if let Some(post) = self.db.get_post_by_uri(post_uri).await? {
            return Ok(post.actor_uri);
        }

        let note = self
            .resolver
            .discovery()
            .get_json(post_uri, &format!("{}, {}", ACTIVITY_JSON, LD_JSON_PROFILE), "object")
            .await?;
        note.get("attributedTo")
            .and_then(object_id)
            .ok_or_else(|| AppError::Federation(format!("{} has no attributedTo", post_uri)))
    }

    /// `username` likes the post at `post_uri`
    ///
    /// Posts on this server must exist. Posts on other servers are liked
    /// speculatively: the edge is stored without a local copy of the post.
    ///
    /// # Errors
    /// `NotFound` for an unknown local post, `Conflict` if already liked
    pub async fn like(
        &self,
        username: &str,
        post_uri: &str,
    ) -> Result<Interaction<LikeEdge>, AppError> {
        let signer = self.signer(username).await?;
        url::Url::parse(post_uri)
            .map_err(|e| AppError::Validation(format!("Invalid post URI: {}", e)))?;
        let local_post = self.is_local_url(post_uri);
        if local_post && self.db.get_post_by_uri(post_uri).await?.is_none() {
            return Err(AppError::NotFound("post".to_string()));
        }

        let edge = LikeEdge {
            id: EntityId::new().0,
            actor_uri: signer.actor_url.clone(),
            object_uri: post_uri.to_string(),
            activity_uri: signer.activity_id("like"),
            created_at: chrono::Utc::now(),
        };
        self.db.insert_like(&edge).await?;

        let delivery_queued = !local_post;
        if delivery_queued {
            let activity = builder::like(&edge.activity_uri, &edge.actor_uri, &edge.object_uri);
            self.queue_for_post_author(signer, post_uri.to_string(), activity);
        }

        tracing::info!(
            actor = %edge.actor_uri,
            post = %edge.object_uri,
            delivery_queued,
            "Stored local like"
        );
        Ok(Interaction {
            record: edge,
            delivery_queued,
        })
    }

    /// Remove a like and queue `Undo{Like}` for the post's author
    ///
    /// # Errors
    /// `Gone` if there was no such like
    pub async fn unlike(
        &self,
        username: &str,
        post_uri: &str,
    ) -> Result<Interaction<LikeEdge>, AppError> {
        let signer = self.signer(username).await?;
        let edge = self
            .db
            .delete_like(&signer.actor_url, post_uri)
            .await?
            .ok_or_else(|| AppError::Gone("like not found".to_string()))?;

        let delivery_queued = !self.is_local_url(post_uri);
        if delivery_queued {
            let like = builder::like(&edge.activity_uri, &edge.actor_uri, &edge.object_uri);
            let undo = builder::undo(&signer.activity_id("undo"), &signer.actor_url, like);
            self.queue_for_post_author(signer, post_uri.to_string(), undo);
        }

        Ok(Interaction {
            record: edge,
            delivery_queued,
        })
    }

    /// Newest posts of any actor, read through its outbox
    pub async fn actor_posts(&self, identifier: &str) -> Result<Vec<RemoteNote>, AppError> {
        let actor = self.resolver.resolve(identifier).await?;

        let items: Vec<Value> = match &actor {
            Actor::Local { url, .. } => self
                .db
                .get_outbox_posts(url, OutboxCursor::Newest, self.config.federation.outbox_page_size)
                .await?
                .iter()
                .map(create_activity)
                .collect(),
            Actor::Remote(remote) => {
                let outbox_url = remote.outbox_uri.as_deref().ok_or_else(|| {
                    AppError::Federation(format!("{} publishes no outbox", remote.uri))
                })?;
                fetch_remote_outbox(self.resolver.discovery(), outbox_url).await?
            }
        };

        Ok(items.iter().filter_map(RemoteNote::from_item).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_note_reads_create_and_bare_note_items() {
        let create = json!({
            "type": "Create",
            "object": {
                "type": "Note",
                "id": "https://remote.example/notes/1",
                "attributedTo": {"id": "https://remote.example/users/bob"},
                "content": "<p>hi</p><script>x</script>",
                "published": "2025-01-01T00:00:00Z"
            }
        });
        let note = RemoteNote::from_item(&create).unwrap();
        assert_eq!(note.id, "https://remote.example/notes/1");
        assert_eq!(note.attributed_to.as_deref(), Some("https://remote.example/users/bob"));
        assert!(!note.content.contains("script"));

        let bare = json!({"type": "Note", "id": "https://remote.example/notes/2", "content": "x"});
        assert!(RemoteNote::from_item(&bare).is_some());

        assert!(RemoteNote::from_item(&json!({"type": "Announce", "object": "x"})).is_none());
        assert!(RemoteNote::from_item(&json!({"type": "Create", "object": "https://x/1"})).is_none());
    }
}
