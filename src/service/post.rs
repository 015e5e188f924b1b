//! Post service
//!
//! Creates local posts and queues the resulting `Create` for the inboxes
//! of the author's followers. The request never waits on a remote server.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::data::{Database, EntityId, NewPost, Post};
use crate::error::AppError;
use crate::federation::{ActivityDelivery, LocalSigner, builder};

const MAX_CONTENT_CHARS: usize = 5000;

/// A stored post and the number of follower inboxes its `Create` was queued for
#[derive(Debug, Clone)]
pub struct PublishedPost {
    pub post: Post,
    pub queued_deliveries: usize,
}

/// Post service
pub struct PostService {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    delivery: Arc<ActivityDelivery>,
}

impl PostService {
    pub fn new(config: Arc<AppConfig>, db: Arc<Database>, delivery: Arc<ActivityDelivery>) -> Self {
        Self {
            config,
            db,
            delivery,
        }
    }

    /// Create a post for a local actor
    ///
    /// # Arguments
    /// * `username` - Local author
    /// * `content` - Plain text; stored as escaped HTML
    /// * `in_reply_to_uri` - URI of the post being replied to
    ///
    /// # Side Effects
    /// - Inserts into database
    /// - Queues `Create` for follower inboxes (best effort, in the background)
    pub async fn create(
        &self,
        username: &str,
        content: &str,
        in_reply_to_uri: Option<String>,
    ) -> Result<PublishedPost, AppError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::Validation("post content is required".to_string()));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(AppError::Validation(format!(
                "post content exceeds {} characters",
                MAX_CONTENT_CHARS
            )));
        }

        let actor = self
            .db
            .get_local_actor(username)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("actor {}", username)))?;
        let actor_url = self.config.server.actor_url(&actor.username);
        let signer = LocalSigner::new(&actor_url, &actor);

        let post_id = EntityId::new().0;
        let uri = format!("{}/posts/{}", actor_url, post_id.to_lowercase());
        let html = format!("<p>{}</p>", ammonia::clean_text(content));
        let published_at = chrono::Utc::now();
        let published = published_at.to_rfc3339();

        let note = builder::note(
            &uri,
            &actor_url,
            &html,
            &published,
            in_reply_to_uri.as_deref(),
        );
        let activity = builder::create(&format!("{}/activity", uri), &actor_url, note, &published);

        let follower_inboxes = self.db.get_follower_inboxes(&actor_url).await?;
        let new_post = NewPost {
            id: post_id,
            uri: uri.clone(),
            actor_uri: actor_url.clone(),
            content: html,
            in_reply_to_uri,
            is_local: true,
            federated: !follower_inboxes.is_empty(),
            activity_json: Some(activity.to_string()),
            published_at,
        };
        self.db.insert_post(&new_post).await?;

        let post = self
            .db
            .get_post_by_uri(&uri)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("post {} vanished after insert", uri)))?;

        let queued_deliveries = self.delivery.spawn_to_many(
            signer,
            activity,
            follower_inboxes.into_iter().map(|f| f.inbox_uri).collect(),
        );

        tracing::info!(
            post = %post.uri,
            author = %actor_url,
            queued_deliveries,
            "Created local post"
        );

        Ok(PublishedPost {
            post,
            queued_deliveries,
        })
    }
}
