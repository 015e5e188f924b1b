//! ActivityPub inbox processing
//!
//! Validates an inbound activity envelope, checks its preconditions against
//! local state and applies it through a single store transaction that also
//! records the activity id. A second delivery of the same id is a conflict
//! with no side effects.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::resolver::ActorResolver;
use crate::data::{Database, EntityId, FollowEdge, InboundWrite, LikeEdge, NewPost, ProcessedActivity};
use crate::error::AppError;
use crate::metrics::ACTIVITIES_RECEIVED;

/// ActivityStreams JSON-LD context
pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Public addressing collection
pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Activity types the inbox understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    Create,
    Follow,
    Accept,
    Undo,
    Like,
}

impl ActivityType {
    /// Parse activity type from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Create" => Some(Self::Create),
            "Follow" => Some(Self::Follow),
            "Accept" => Some(Self::Accept),
            "Undo" => Some(Self::Undo),
            "Like" => Some(Self::Like),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Undo => "Undo",
            Self::Like => "Like",
        }
    }
}

/// The `actor` of an activity: a bare URL or an embedded actor object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActorRef {
    Url(String),
    Embedded {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl ActorRef {
    /// The actor's canonical URL, fragment removed
    ///
    /// Only absolute http(s) URLs are accepted.
    pub fn canonical_url(&self) -> Result<String, AppError> {
        let raw = match self {
            ActorRef::Url(url) => url,
            ActorRef::Embedded { id, .. } => id,
        };
        canonical_http_url(raw).ok_or_else(|| AppError::Validation(format!("Invalid actor: {}", raw)))
    }
}

/// Inbound activity as received on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEnvelope {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub actor: ActorRef,
    #[serde(default)]
    pub object: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
}

impl ActivityEnvelope {
    /// Decode an inbox request body
    pub fn from_slice(body: &[u8]) -> Result<Self, AppError> {
        serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("Malformed activity: {}", e)))
    }
}

/// `Note` object carried by a Create
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoteObject {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    content: String,
    #[serde(default)]
    attributed_to: Option<Value>,
    #[serde(default)]
    in_reply_to: Option<Value>,
    #[serde(default)]
    published: Option<DateTime<Utc>>,
}

/// Typed view of an envelope, after shape validation
#[derive(Debug, Clone)]
enum InboundActivity {
    Create(NoteObject),
    Like { object: String },
    Follow { object: String },
    UndoLike { object: String },
    UndoFollow { object: String },
    AcceptFollow(AcceptedFollow),
}

#[derive(Debug, Clone)]
enum AcceptedFollow {
    /// Follow embedded as an object
    Embedded { actor: String, object: Option<String> },
    /// Follow referenced by its activity id
    Reference(String),
}

impl InboundActivity {
    fn from_envelope(envelope: &ActivityEnvelope, actor_url: &str) -> Result<Self, AppError> {
        let activity_type = ActivityType::from_str(&envelope.kind).ok_or_else(|| {
            AppError::Validation(format!("Unsupported activity type: {}", envelope.kind))
        })?;

        match activity_type {
            ActivityType::Create => {
                let note: NoteObject = serde_json::from_value(envelope.object.clone())
                    .map_err(|e| AppError::Validation(format!("Malformed Note: {}", e)))?;
                if note.kind != "Note" {
                    return Err(AppError::Validation(format!(
                        "Unsupported Create object type: {}",
                        note.kind
                    )));
                }
                Ok(Self::Create(note))
            }
            ActivityType::Like => Ok(Self::Like {
                object: required_object_id(&envelope.object, "Like")?,
            }),
            ActivityType::Follow => Ok(Self::Follow {
                object: required_object_id(&envelope.object, "Follow")?,
            }),
            ActivityType::Undo => {
                let inner = envelope.object.as_object().ok_or_else(|| {
                    AppError::Validation("Undo must embed the activity it reverts".to_string())
                })?;
                if let Some(inner_actor) = inner.get("actor").and_then(object_id) {
                    if canonical_http_url(&inner_actor).as_deref() != Some(actor_url) {
                        return Err(AppError::Validation(
                            "Undo of another actor's activity".to_string(),
                        ));
                    }
                }

                let inner_type = inner.get("type").and_then(Value::as_str).unwrap_or_default();
                let target = inner.get("object").cloned().unwrap_or(Value::Null);
                match ActivityType::from_str(inner_type) {
                    Some(ActivityType::Like) => Ok(Self::UndoLike {
                        object: required_object_id(&target, "Undo Like")?,
                    }),
                    Some(ActivityType::Follow) => Ok(Self::UndoFollow {
                        object: required_object_id(&target, "Undo Follow")?,
                    }),
                    _ => Err(AppError::Validation(format!(
                        "Unsupported Undo object type: {}",
                        inner_type
                    ))),
                }
            }
            ActivityType::Accept => match &envelope.object {
                Value::String(follow_id) => {
                    Ok(Self::AcceptFollow(AcceptedFollow::Reference(follow_id.clone())))
                }
                Value::Object(follow) => {
                    let follow_type = follow.get("type").and_then(Value::as_str);
                    if follow_type != Some("Follow") {
                        return Err(AppError::Validation(
                            "Accept object must be a Follow".to_string(),
                        ));
                    }
                    match follow.get("actor").and_then(object_id) {
                        Some(follower) => Ok(Self::AcceptFollow(AcceptedFollow::Embedded {
                            actor: follower,
                            object: follow.get("object").and_then(object_id),
                        })),
                        None => match follow.get("id").and_then(Value::as_str) {
                            Some(id) => {
                                Ok(Self::AcceptFollow(AcceptedFollow::Reference(id.to_string())))
                            }
                            None => Err(AppError::Validation(
                                "Accepted Follow has neither actor nor id".to_string(),
                            )),
                        },
                    }
                }
                _ => Err(AppError::Validation(
                    "Accept object must be a Follow".to_string(),
                )),
            },
        }
    }
}

/// Deferred Accept for a freshly stored Follow
///
/// Built from owned values only so the delivery can run after the inbox
/// request has been answered.
#[derive(Debug, Clone)]
pub struct AcceptTask {
    /// Remote follower, recipient of the Accept
    pub follower_url: String,
    /// Local actor that was followed, author of the Accept
    pub local_actor_url: String,
    /// The Follow activity being accepted
    pub follow_activity: Value,
}

/// What the inbox handler has to do after a successful `process`
#[derive(Debug, Clone, Default)]
pub struct InboxOutcome {
    pub accept: Option<AcceptTask>,
}

/// Inbox state machine
pub struct InboxProcessor {
    db: Arc<Database>,
    resolver: Arc<ActorResolver>,
}

impl InboxProcessor {
    pub fn new(db: Arc<Database>, resolver: Arc<ActorResolver>) -> Self {
        Self { db, resolver }
    }

    /// Validate and apply one inbound activity
    ///
    /// `signer` is the actor URL whose signature was verified on the request.
    pub async fn process(
        &self,
        envelope: &ActivityEnvelope,
        signer: &str,
    ) -> Result<InboxOutcome, AppError> {
        let result = self.process_inner(envelope, signer).await;

        let outcome = match &result {
            Ok(_) => "applied",
            Err(error) => error.kind(),
        };
        ACTIVITIES_RECEIVED
            .with_label_values(&[envelope.kind.as_str(), outcome])
            .inc();

        match &result {
            Ok(_) => tracing::info!(
                activity = %envelope.id,
                activity_type = %envelope.kind,
                actor = signer,
                "Applied inbound activity"
            ),
            Err(error) => tracing::debug!(
                activity = %envelope.id,
                activity_type = %envelope.kind,
                %error,
                "Rejected inbound activity"
            ),
        }

        result
    }

    async fn process_inner(
        &self,
        envelope: &ActivityEnvelope,
        signer: &str,
    ) -> Result<InboxOutcome, AppError> {
        let actor_url = envelope.actor.canonical_url()?;
        if actor_url != signer {
            tracing::debug!(actor = %actor_url, signer, "Signer does not match activity actor");
            return Err(AppError::InvalidSignature);
        }
        if envelope.id.trim().is_empty() {
            return Err(AppError::Validation("Activity id is required".to_string()));
        }

        let activity = InboundActivity::from_envelope(envelope, &actor_url)?;
        let ledger = ProcessedActivity {
            id: envelope.id.clone(),
            activity_type: envelope.kind.clone(),
            actor_uri: actor_url.clone(),
            received_at: Utc::now(),
        };

        let mut outcome = InboxOutcome::default();
        let write = match activity {
            InboundActivity::Create(note) => {
                InboundWrite::InsertPost(self.new_remote_post(envelope, &actor_url, note)?)
            }
            InboundActivity::Like { object } => {
                self.require_post(&object).await?;
                InboundWrite::InsertLike(LikeEdge {
                    id: EntityId::new().0,
                    actor_uri: actor_url.clone(),
                    object_uri: object,
                    activity_uri: envelope.id.clone(),
                    created_at: Utc::now(),
                })
            }
            InboundActivity::UndoLike { object } => {
                self.require_post(&object).await?;
                InboundWrite::DeleteLike {
                    actor_uri: actor_url.clone(),
                    object_uri: object,
                }
            }
            InboundActivity::Follow { object } => {
                let local_actor_url = self.require_local_actor(&object).await?;
                outcome.accept = Some(AcceptTask {
                    follower_url: actor_url.clone(),
                    local_actor_url: local_actor_url.clone(),
                    follow_activity: serde_json::to_value(envelope)
                        .map_err(|e| AppError::Internal(e.into()))?,
                });
                InboundWrite::InsertFollow(FollowEdge {
                    id: EntityId::new().0,
                    actor_uri: actor_url.clone(),
                    object_uri: local_actor_url,
                    activity_uri: envelope.id.clone(),
                    accepted_at: None,
                    created_at: Utc::now(),
                })
            }
            InboundActivity::UndoFollow { object } => InboundWrite::DeleteFollow {
                actor_uri: actor_url.clone(),
                object_uri: self.follow_target(object).await?,
            },
            InboundActivity::AcceptFollow(follow) => self.accepted_follow(follow, &actor_url).await?,
        };

        self.db.apply_inbound(&ledger, &write).await?;
        Ok(outcome)
    }

    fn new_remote_post(
        &self,
        envelope: &ActivityEnvelope,
        actor_url: &str,
        note: NoteObject,
    ) -> Result<NewPost, AppError> {
        let note_url = url::Url::parse(&note.id)
            .map_err(|e| AppError::Validation(format!("Invalid Note id: {}", e)))?;
        let actor = url::Url::parse(actor_url)
            .map_err(|e| AppError::Validation(format!("Invalid actor: {}", e)))?;
        if note_url.host_str() != actor.host_str() || note_url.port() != actor.port() {
            return Err(AppError::Validation(
                "Note id is not on the actor's server".to_string(),
            ));
        }

        if let Some(attributed_to) = note.attributed_to.as_ref() {
            let author = object_id(attributed_to).and_then(|id| canonical_http_url(&id));
            if author.as_deref() != Some(actor_url) {
                return Err(AppError::Validation(
                    "Note attributedTo does not match activity actor".to_string(),
                ));
            }
        }

        let published_at = note
            .published
            .or_else(|| {
                envelope
                    .published
                    .as_deref()
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|dt| dt.with_timezone(&Utc))
            })
            .unwrap_or_else(Utc::now);

        Ok(NewPost {
            id: EntityId::new().0,
            uri: note.id,
            actor_uri: actor_url.to_string(),
            content: sanitize_remote_html(&note.content),
            in_reply_to_uri: note.in_reply_to.as_ref().and_then(object_id),
            is_local: false,
            federated: true,
            activity_json: serde_json::to_string(envelope).ok(),
            published_at,
        })
    }

    async fn require_post(&self, uri: &str) -> Result<(), AppError> {
        match self.db.get_post_by_uri(uri).await? {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound("post".to_string())),
        }
    }

    /// Canonical URL of the local actor `object` names
    async fn require_local_actor(&self, object: &str) -> Result<String, AppError> {
        let username = url::Url::parse(object)
            .ok()
            .and_then(|url| self.resolver.local_username_from_url(&url))
            .ok_or_else(|| AppError::NotFound("actor".to_string()))?;
        let actor = self
            .db
            .get_local_actor(&username)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("actor {}", username)))?;
        Ok(self.resolver.local_actor_url(&actor.username))
    }

    /// Stored form of an Undo'd follow target
    ///
    /// Local actors are named the way `Follow` stored them; anything else
    /// just loses its fragment and will simply not match an edge.
    async fn follow_target(&self, object: String) -> Result<String, AppError> {
        match self.require_local_actor(&object).await {
            Ok(local_actor_url) => Ok(local_actor_url),
            Err(AppError::NotFound(_)) => Ok(canonical_http_url(&object).unwrap_or(object)),
            Err(error) => Err(error),
        }
    }

    async fn accepted_follow(
        &self,
        follow: AcceptedFollow,
        acceptor: &str,
    ) -> Result<InboundWrite, AppError> {
        match follow {
            AcceptedFollow::Embedded { actor, object } => {
                let follower = url::Url::parse(&actor)
                    .ok()
                    .and_then(|url| self.resolver.local_username_from_url(&url))
                    .map(|username| self.resolver.local_actor_url(&username))
                    .ok_or_else(|| {
                        AppError::Validation("Accepted Follow was not sent from here".to_string())
                    })?;
                if let Some(object) = object {
                    if canonical_http_url(&object).as_deref() != Some(acceptor) {
                        return Err(AppError::Validation(
                            "Accept must come from the followed actor".to_string(),
                        ));
                    }
                }
                Ok(InboundWrite::AcceptFollow {
                    actor_uri: follower,
                    object_uri: acceptor.to_string(),
                })
            }
            AcceptedFollow::Reference(follow_id) => {
                let edge = self
                    .db
                    .get_follow_by_activity(&follow_id)
                    .await?
                    .filter(|edge| edge.object_uri == acceptor)
                    .ok_or_else(|| AppError::NotFound("follow".to_string()))?;
                Ok(InboundWrite::AcceptFollow {
                    actor_uri: edge.actor_uri,
                    object_uri: edge.object_uri,
                })
            }
        }
    }
}

/// Id of an object reference: a bare string or an object with `id`
pub fn object_id(value: &Value) -> Option<String> {
    value
        .as_str()
        .or_else(|| value.get("id").and_then(Value::as_str))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn required_object_id(value: &Value, context: &str) -> Result<String, AppError> {
    object_id(value).ok_or_else(|| AppError::Validation(format!("Missing object in {}", context)))
}

fn canonical_http_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let url = url::Url::parse(trimmed).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    Some(without_fragment.to_string())
}

fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}
