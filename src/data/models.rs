//! Data models
//!
//! Rust structs representing stored federation state.
//! All models use ULID for IDs and chrono for timestamps. Actors are
//! referenced by canonical URL string, never by foreign key, so a remote
//! actor refresh never touches stored edges or posts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Actors
// =============================================================================

/// An actor owned by this server
///
/// Created at activation, which is also when its key pair is generated.
/// The private key never leaves the vault-encrypted form at rest.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LocalActor {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    /// SPKI PEM
    pub public_key_pem: String,
    /// PKCS#8 PEM sealed by the key vault
    #[serde(skip_serializing)]
    pub encrypted_private_key_pem: String,
    pub activated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cached projection of an actor that lives on another server
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteActor {
    /// Canonical actor URL (identity)
    pub uri: String,
    pub username: String,
    pub domain: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub inbox_uri: String,
    pub outbox_uri: Option<String>,
    pub followers_uri: Option<String>,
    pub following_uri: Option<String>,
    pub public_key_id: String,
    pub public_key_pem: String,
    pub fetched_at: DateTime<Utc>,
}

// =============================================================================
// Posts
// =============================================================================

/// A post, local or received through federation
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    /// Store ordering key used by outbox cursors
    pub seq: i64,
    pub id: String,
    /// ActivityPub URI (globally unique)
    pub uri: String,
    /// Author's canonical actor URL
    pub actor_uri: String,
    /// Sanitized HTML content
    pub content: String,
    pub in_reply_to_uri: Option<String>,
    pub is_local: bool,
    /// Whether this post arrived through (or was sent out over) federation
    pub federated: bool,
    /// Wrapping activity as received or sent
    pub activity_json: Option<String>,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Post data before the store assigns `seq`
#[derive(Debug, Clone)]
pub struct NewPost {
    pub id: String,
    pub uri: String,
    pub actor_uri: String,
    pub content: String,
    pub in_reply_to_uri: Option<String>,
    pub is_local: bool,
    pub federated: bool,
    pub activity_json: Option<String>,
    pub published_at: DateTime<Utc>,
}

// =============================================================================
// Edges
// =============================================================================

/// `actor_uri` follows `object_uri`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowEdge {
    pub id: String,
    pub actor_uri: String,
    pub object_uri: String,
    /// Follow activity id
    pub activity_uri: String,
    /// Set when an Accept for this follow arrives; never gates the edge
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// `actor_uri` likes the post at `object_uri`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LikeEdge {
    pub id: String,
    pub actor_uri: String,
    pub object_uri: String,
    /// Like activity id
    pub activity_uri: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Inbox ledger
// =============================================================================

/// An inbound activity that has been applied
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessedActivity {
    pub id: String,
    pub activity_type: String,
    pub actor_uri: String,
    pub received_at: DateTime<Utc>,
}

/// Follower row joined with its cached inbox, used for fan-out
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FollowerInbox {
    pub actor_uri: String,
    pub inbox_uri: String,
}
