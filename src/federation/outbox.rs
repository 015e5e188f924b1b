//! Outbox collections
//!
//! Serves an actor's posts as an `OrderedCollection` whose pages are walked
//! with `max_id` (older) and `min_id` (newer) cursors over the store's
//! `seq`, and reads remote outboxes for cross-server post retrieval.

use serde::Deserialize;
use serde_json::{Value, json};

use super::activity::{AS_CONTEXT, AS_PUBLIC};
use super::webfinger::{ACTIVITY_JSON, DiscoveryClient, LD_JSON_PROFILE};
use crate::data::{Database, OutboxCursor, Post};
use crate::error::AppError;

/// Query string of `GET /users/:username/outbox`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutboxQuery {
    #[serde(default)]
    pub page: Option<String>,
    #[serde(default)]
    pub min_id: Option<i64>,
    #[serde(default)]
    pub max_id: Option<i64>,
}

impl OutboxQuery {
    /// Whether a page (rather than the collection summary) was asked for
    pub fn is_page(&self) -> bool {
        self.page.as_deref().is_some_and(|page| page == "true")
            || self.min_id.is_some()
            || self.max_id.is_some()
    }

    pub fn cursor(&self) -> Result<OutboxCursor, AppError> {
        match (self.max_id, self.min_id) {
            (Some(_), Some(_)) => Err(AppError::Validation(
                "max_id and min_id are mutually exclusive".to_string(),
            )),
            (Some(max_id), None) => Ok(OutboxCursor::Before(max_id)),
            (None, Some(min_id)) => Ok(OutboxCursor::After(min_id)),
            (None, None) => Ok(OutboxCursor::Newest),
        }
    }
}

/// Builds outbox documents for one local actor
pub struct OutboxPager<'a> {
    db: &'a Database,
    actor_url: &'a str,
    page_size: u32,
}

impl<'a> OutboxPager<'a> {
    pub fn new(db: &'a Database, actor_url: &'a str, page_size: u32) -> Self {
        Self {
            db,
            actor_url,
            page_size,
        }
    }

    fn outbox_url(&self) -> String {
        format!("{}/outbox", self.actor_url)
    }

    /// `OrderedCollection` with `totalItems` and links to the first and last pages
    pub async fn summary(&self) -> Result<Value, AppError> {
        let total = self.db.count_posts_by_actor(self.actor_url).await?;
        let outbox_url = self.outbox_url();

        Ok(json!({
            "@context": AS_CONTEXT,
            "id": outbox_url,
            "type": "OrderedCollection",
            "totalItems": total,
            "first": format!("{}?page=true", outbox_url),
            "last": format!("{}?page=true&min_id=0", outbox_url),
        }))
    }

    /// One `OrderedCollectionPage`, newest item first
    pub async fn page(&self, cursor: OutboxCursor) -> Result<Value, AppError> {
        let posts = self
            .db
            .get_outbox_posts(self.actor_url, cursor, self.page_size)
            .await?;
        let outbox_url = self.outbox_url();

        let id = match cursor {
            OutboxCursor::Newest => format!("{}?page=true", outbox_url),
            OutboxCursor::Before(seq) => format!("{}?page=true&max_id={}", outbox_url, seq),
            OutboxCursor::After(seq) => format!("{}?page=true&min_id={}", outbox_url, seq),
        };

        let mut page = json!({
            "@context": AS_CONTEXT,
            "id": id,
            "type": "OrderedCollectionPage",
            "partOf": outbox_url,
            "orderedItems": posts.iter().map(|post| create_activity(post)).collect::<Vec<_>>(),
        });

        if let (Some(newest), Some(oldest)) = (posts.first(), posts.last()) {
            if self.db.has_posts_before(self.actor_url, oldest.seq).await? {
                page["next"] = json!(format!("{}?page=true&max_id={}", outbox_url, oldest.seq));
            }
            if self.db.has_posts_after(self.actor_url, newest.seq).await? {
                page["prev"] = json!(format!("{}?page=true&min_id={}", outbox_url, newest.seq));
            }
        }

        Ok(page)
    }
}

/// `Create` wrapping the post's `Note`
///
/// Posts that were delivered keep the activity that was sent; the rest get
/// one derived from the stored row.
pub fn create_activity(post: &Post) -> Value {
    if let Some(stored) = post
        .activity_json
        .as_deref()
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .filter(|activity| activity.get("type").and_then(Value::as_str) == Some("Create"))
    {
        return stored;
    }

    let published = post.published_at.to_rfc3339();
    json!({
        "id": format!("{}/activity", post.uri),
        "type": "Create",
        "actor": post.actor_uri,
        "published": published,
        "to": [AS_PUBLIC],
        "cc": [format!("{}/followers", post.actor_uri)],
        "object": {
            "id": post.uri,
            "type": "Note",
            "attributedTo": post.actor_uri,
            "content": post.content,
            "inReplyTo": post.in_reply_to_uri,
            "published": published,
            "to": [AS_PUBLIC],
            "cc": [format!("{}/followers", post.actor_uri)],
        }
    })
}

/// Read the items of a remote outbox
///
/// Uses the collection's own `orderedItems` when present; otherwise follows
/// `first` once, whether it is embedded or a URL. Anything else yields an
/// empty list.
pub async fn fetch_remote_outbox(
    discovery: &DiscoveryClient,
    outbox_url: &str,
) -> Result<Vec<Value>, AppError> {
    let accept = format!("{}, {}", ACTIVITY_JSON, LD_JSON_PROFILE);
    let collection = discovery.get_json(outbox_url, &accept, "outbox").await?;

    if let Some(items) = non_empty_items(&collection) {
        return Ok(items);
    }

    let first_page = match collection.get("first") {
        Some(Value::String(first_url)) => discovery.get_json(first_url, &accept, "outbox").await?,
        Some(embedded @ Value::Object(_)) => embedded.clone(),
        _ => {
            tracing::debug!(outbox = outbox_url, "Remote outbox has no items and no first page");
            return Ok(Vec::new());
        }
    };

    Ok(non_empty_items(&first_page).unwrap_or_default())
}

fn non_empty_items(collection: &Value) -> Option<Vec<Value>> {
    collection
        .get("orderedItems")
        .or_else(|| collection.get("items"))
        .and_then(Value::as_array)
        .filter(|items| !items.is_empty())
        .cloned()
}
