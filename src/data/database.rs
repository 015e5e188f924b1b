//! SQLite database operations
//!
//! All database access goes through this module.
//! Uniqueness of `(actor, object)` edges and of post URIs is enforced by the
//! schema, so concurrent inserts race on the constraint and exactly one wins.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite, SqliteConnection, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Direction of an outbox page relative to a `seq` cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxCursor {
    /// The newest page
    Newest,
    /// Items with `seq` strictly lower than the value
    Before(i64),
    /// Items with `seq` strictly greater than the value, closest first
    After(i64),
}

/// A state change applied atomically together with its inbox ledger entry
#[derive(Debug, Clone)]
pub enum InboundWrite {
    InsertPost(NewPost),
    InsertFollow(FollowEdge),
    DeleteFollow { actor_uri: String, object_uri: String },
    AcceptFollow { actor_uri: String, object_uri: String },
    InsertLike(LikeEdge),
    DeleteLike { actor_uri: String, object_uri: String },
}

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist and runs the embedded
    /// migrations.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!(path = %path.display(), "Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Local actors
    // =========================================================================

    /// Insert a freshly activated local actor
    ///
    /// A handle collision surfaces as `Conflict`.
    pub async fn insert_local_actor(&self, actor: &LocalActor) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO local_actors (
                id, username, display_name, summary, public_key_pem,
                encrypted_private_key_pem, activated, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.username)
        .bind(&actor.display_name)
        .bind(&actor.summary)
        .bind(&actor.public_key_pem)
        .bind(&actor.encrypted_private_key_pem)
        .bind(actor.activated)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(AppError::Conflict(
                format!("actor {} already exists", actor.username),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Look up an activated local actor by handle (case-insensitive)
    pub async fn get_local_actor(&self, username: &str) -> Result<Option<LocalActor>, AppError> {
        let actor = sqlx::query_as::<_, LocalActor>(
            "SELECT * FROM local_actors WHERE username = ? COLLATE NOCASE AND activated = 1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    // =========================================================================
    // Remote actors
    // =========================================================================

    /// Insert or refresh a remote actor projection
    pub async fn upsert_remote_actor(&self, actor: &RemoteActor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO remote_actors (
                uri, username, domain, display_name, summary, inbox_uri, outbox_uri,
                followers_uri, following_uri, public_key_id, public_key_pem, fetched_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(uri) DO UPDATE SET
                username = excluded.username,
                domain = excluded.domain,
                display_name = excluded.display_name,
                summary = excluded.summary,
                inbox_uri = excluded.inbox_uri,
                outbox_uri = excluded.outbox_uri,
                followers_uri = excluded.followers_uri,
                following_uri = excluded.following_uri,
                public_key_id = excluded.public_key_id,
                public_key_pem = excluded.public_key_pem,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(&actor.uri)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.display_name)
        .bind(&actor.summary)
        .bind(&actor.inbox_uri)
        .bind(&actor.outbox_uri)
        .bind(&actor.followers_uri)
        .bind(&actor.following_uri)
        .bind(&actor.public_key_id)
        .bind(&actor.public_key_pem)
        .bind(actor.fetched_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_remote_actor(&self, uri: &str) -> Result<Option<RemoteActor>, AppError> {
        let actor = sqlx::query_as::<_, RemoteActor>("SELECT * FROM remote_actors WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    // =========================================================================
    // Posts
    // =========================================================================

    /// Insert a post and return its `seq`
    pub async fn insert_post(&self, post: &NewPost) -> Result<i64, AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_post_on(&mut conn, post).await
    }

    pub async fn get_post_by_uri(&self, uri: &str) -> Result<Option<Post>, AppError> {
        let post = sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE uri = ?")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(post)
    }

    pub async fn count_posts_by_actor(&self, actor_uri: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM posts WHERE actor_uri = ?")
            .bind(actor_uri)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// One outbox page, always ordered newest first
    pub async fn get_outbox_posts(
        &self,
        actor_uri: &str,
        cursor: OutboxCursor,
        limit: u32,
    ) -> Result<Vec<Post>, AppError> {
        let limit = i64::from(limit);
        let posts = match cursor {
            OutboxCursor::Newest => {
                sqlx::query_as::<_, Post>(
                    "SELECT * FROM posts WHERE actor_uri = ? ORDER BY seq DESC LIMIT ?",
                )
                .bind(actor_uri)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            OutboxCursor::Before(max_id) => {
                sqlx::query_as::<_, Post>(
                    "SELECT * FROM posts WHERE actor_uri = ? AND seq < ? ORDER BY seq DESC LIMIT ?",
                )
                .bind(actor_uri)
                .bind(max_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            OutboxCursor::After(min_id) => {
                let mut posts = sqlx::query_as::<_, Post>(
                    "SELECT * FROM posts WHERE actor_uri = ? AND seq > ? ORDER BY seq ASC LIMIT ?",
                )
                .bind(actor_uri)
                .bind(min_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
                posts.reverse();
                posts
            }
        };

        Ok(posts)
    }

    pub async fn has_posts_before(&self, actor_uri: &str, seq: i64) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT EXISTS(SELECT 1 FROM posts WHERE actor_uri = ? AND seq < ?)",
        )
        .bind(actor_uri)
        .bind(seq)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists != 0)
    }

    pub async fn has_posts_after(&self, actor_uri: &str, seq: i64) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT EXISTS(SELECT 1 FROM posts WHERE actor_uri = ? AND seq > ?)",
        )
        .bind(actor_uri)
        .bind(seq)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists != 0)
    }

    // =========================================================================
    // Follows
    // =========================================================================

    /// Insert a follow edge; a duplicate `(actor, object)` is `Conflict`
    pub async fn insert_follow(&self, follow: &FollowEdge) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_follow_on(&mut conn, follow).await
    }

    /// Delete a follow edge, returning the removed row
    pub async fn delete_follow(
        &self,
        actor_uri: &str,
        object_uri: &str,
    ) -> Result<Option<FollowEdge>, AppError> {
        let edge = sqlx::query_as::<_, FollowEdge>(
            "DELETE FROM follows WHERE actor_uri = ? AND object_uri = ? RETURNING *",
        )
        .bind(actor_uri)
        .bind(object_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(edge)
    }

    pub async fn get_follow(
        &self,
        actor_uri: &str,
        object_uri: &str,
    ) -> Result<Option<FollowEdge>, AppError> {
        let edge = sqlx::query_as::<_, FollowEdge>(
            "SELECT * FROM follows WHERE actor_uri = ? AND object_uri = ?",
        )
        .bind(actor_uri)
        .bind(object_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(edge)
    }

    /// Follow edge created by the Follow activity `activity_uri`
    pub async fn get_follow_by_activity(
        &self,
        activity_uri: &str,
    ) -> Result<Option<FollowEdge>, AppError> {
        let edge = sqlx::query_as::<_, FollowEdge>("SELECT * FROM follows WHERE activity_uri = ?")
            .bind(activity_uri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(edge)
    }

    /// Actor URLs following `object_uri`, oldest first
    pub async fn get_follower_uris(&self, object_uri: &str) -> Result<Vec<String>, AppError> {
        let uris = sqlx::query_scalar::<_, String>(
            "SELECT actor_uri FROM follows WHERE object_uri = ? ORDER BY created_at ASC",
        )
        .bind(object_uri)
        .fetch_all(&self.pool)
        .await?;

        Ok(uris)
    }

    /// Actor URLs followed by `actor_uri`, oldest first
    pub async fn get_following_uris(&self, actor_uri: &str) -> Result<Vec<String>, AppError> {
        let uris = sqlx::query_scalar::<_, String>(
            "SELECT object_uri FROM follows WHERE actor_uri = ? ORDER BY created_at ASC",
        )
        .bind(actor_uri)
        .fetch_all(&self.pool)
        .await?;

        Ok(uris)
    }

    /// Remote followers of `object_uri` whose inbox is known
    pub async fn get_follower_inboxes(
        &self,
        object_uri: &str,
    ) -> Result<Vec<FollowerInbox>, AppError> {
        let inboxes = sqlx::query_as::<_, FollowerInbox>(
            r#"
            SELECT f.actor_uri AS actor_uri, r.inbox_uri AS inbox_uri
            FROM follows f
            JOIN remote_actors r ON r.uri = f.actor_uri
            WHERE f.object_uri = ?
            "#,
        )
        .bind(object_uri)
        .fetch_all(&self.pool)
        .await?;

        Ok(inboxes)
    }

    // =========================================================================
    // Likes
    // =========================================================================

    /// Insert a like edge; a duplicate `(actor, object)` is `Conflict`
    pub async fn insert_like(&self, like: &LikeEdge) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        insert_like_on(&mut conn, like).await
    }

    /// Delete a like edge, returning the removed row
    pub async fn delete_like(
        &self,
        actor_uri: &str,
        object_uri: &str,
    ) -> Result<Option<LikeEdge>, AppError> {
        let edge = sqlx::query_as::<_, LikeEdge>(
            "DELETE FROM likes WHERE actor_uri = ? AND object_uri = ? RETURNING *",
        )
        .bind(actor_uri)
        .bind(object_uri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(edge)
    }

    pub async fn count_likes(&self, object_uri: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM likes WHERE object_uri = ?")
            .bind(object_uri)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Inbox
    // =========================================================================

    pub async fn is_activity_processed(&self, activity_id: &str) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT EXISTS(SELECT 1 FROM inbox_activities WHERE id = ?)",
        )
        .bind(activity_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists != 0)
    }

    /// Forget applied activity ids received before `cutoff`
    ///
    /// Returns the number of ledger rows removed.
    pub async fn prune_processed_activities(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM inbox_activities WHERE received_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Record an inbound activity and apply its state change in one transaction
    ///
    /// Either both the ledger row and the write land, or neither does.
    /// Duplicate activity ids and duplicate edges are `Conflict`, removing an
    /// absent edge is `Gone`, accepting an unknown follow is `NotFound`.
    pub async fn apply_inbound(
        &self,
        ledger: &ProcessedActivity,
        write: &InboundWrite,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let recorded = sqlx::query(
            "INSERT INTO inbox_activities (id, activity_type, actor_uri, received_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&ledger.id)
        .bind(&ledger.activity_type)
        .bind(&ledger.actor_uri)
        .bind(ledger.received_at)
        .execute(&mut *tx)
        .await;

        match recorded {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(AppError::Conflict("activity already processed".to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        match write {
            InboundWrite::InsertPost(post) => {
                insert_post_on(&mut tx, post).await?;
            }
            InboundWrite::InsertFollow(follow) => insert_follow_on(&mut tx, follow).await?,
            InboundWrite::InsertLike(like) => insert_like_on(&mut tx, like).await?,
            InboundWrite::DeleteFollow {
                actor_uri,
                object_uri,
            } => {
                let result = sqlx::query("DELETE FROM follows WHERE actor_uri = ? AND object_uri = ?")
                    .bind(actor_uri)
                    .bind(object_uri)
                    .execute(&mut *tx)
                    .await?;
                if result.rows_affected() == 0 {
                    return Err(AppError::Gone("follow not found".to_string()));
                }
            }
            InboundWrite::DeleteLike {
                actor_uri,
                object_uri,
            } => {
                let result = sqlx::query("DELETE FROM likes WHERE actor_uri = ? AND object_uri = ?")
                    .bind(actor_uri)
                    .bind(object_uri)
                    .execute(&mut *tx)
                    .await?;
                if result.rows_affected() == 0 {
                    return Err(AppError::Gone("like not found".to_string()));
                }
            }
            InboundWrite::AcceptFollow {
                actor_uri,
                object_uri,
            } => {
                let result = sqlx::query(
                    "UPDATE follows SET accepted_at = ? WHERE actor_uri = ? AND object_uri = ?",
                )
                .bind(Utc::now())
                .bind(actor_uri)
                .bind(object_uri)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(AppError::NotFound("follow".to_string()));
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

async fn insert_post_on(conn: &mut SqliteConnection, post: &NewPost) -> Result<i64, AppError> {
    let result = sqlx::query(
        r#"
        INSERT INTO posts (
            id, uri, actor_uri, content, in_reply_to_uri, is_local, federated,
            activity_json, published_at, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&post.id)
    .bind(&post.uri)
    .bind(&post.actor_uri)
    .bind(&post.content)
    .bind(&post.in_reply_to_uri)
    .bind(post.is_local)
    .bind(post.federated)
    .bind(&post.activity_json)
    .bind(post.published_at)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await;

    match result {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(AppError::Conflict("post already exists".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn insert_follow_on(conn: &mut SqliteConnection, follow: &FollowEdge) -> Result<(), AppError> {
    let result = sqlx::query(
        r#"
        INSERT INTO follows (id, actor_uri, object_uri, activity_uri, accepted_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&follow.id)
    .bind(&follow.actor_uri)
    .bind(&follow.object_uri)
    .bind(&follow.activity_uri)
    .bind(follow.accepted_at)
    .bind(follow.created_at)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(AppError::Conflict("follow already exists".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

async fn insert_like_on(conn: &mut SqliteConnection, like: &LikeEdge) -> Result<(), AppError> {
    let result = sqlx::query(
        r#"
        INSERT INTO likes (id, actor_uri, object_uri, activity_uri, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&like.id)
    .bind(&like.actor_uri)
    .bind(&like.object_uri)
    .bind(&like.activity_uri)
    .bind(like.created_at)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            Err(AppError::Conflict("like already exists".to_string()))
        }
        Err(e) => Err(e.into()),
    }
}
