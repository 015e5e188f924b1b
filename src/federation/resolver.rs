//! Actor directory resolution
//!
//! Turns an identifier (canonical actor URL or `[acct:][@]handle[@domain]`)
//! into an [`Actor`]. Identifiers on this server's domain are answered from
//! the local store; everything else goes through discovery and is upserted
//! into the remote actor table.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::actor_cache::ActorCache;
use super::guard::authority_of;
use super::keys::main_key_id;
use super::webfinger::{ActorDocument, DiscoveryClient};
use crate::config::AppConfig;
use crate::data::{Database, LocalActor, RemoteActor};
use crate::error::AppError;

/// A resolved actor, local or remote
#[derive(Debug, Clone)]
pub enum Actor {
    Local { url: String, actor: LocalActor },
    Remote(RemoteActor),
}

impl Actor {
    /// Canonical actor URL
    pub fn url(&self) -> &str {
        match self {
            Actor::Local { url, .. } => url,
            Actor::Remote(remote) => &remote.uri,
        }
    }

    pub fn inbox(&self) -> String {
        match self {
            Actor::Local { url, .. } => format!("{}/inbox", url),
            Actor::Remote(remote) => remote.inbox_uri.clone(),
        }
    }

    pub fn outbox(&self) -> Option<String> {
        match self {
            Actor::Local { url, .. } => Some(format!("{}/outbox", url)),
            Actor::Remote(remote) => remote.outbox_uri.clone(),
        }
    }

    pub fn key_id(&self) -> String {
        match self {
            Actor::Local { url, .. } => main_key_id(url),
            Actor::Remote(remote) => remote.public_key_id.clone(),
        }
    }

    pub fn public_key_pem(&self) -> &str {
        match self {
            Actor::Local { actor, .. } => &actor.public_key_pem,
            Actor::Remote(remote) => &remote.public_key_pem,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Actor::Local { .. })
    }
}

/// Parsed actor identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorIdentifier {
    Url(url::Url),
    Handle {
        username: String,
        domain: Option<String>,
    },
}

impl ActorIdentifier {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let trimmed = raw.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            let url = url::Url::parse(trimmed)
                .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;
            return Ok(ActorIdentifier::Url(url));
        }

        let handle = trimmed.strip_prefix("acct:").unwrap_or(trimmed);
        let handle = handle.strip_prefix('@').unwrap_or(handle);
        let (username, domain) = match handle.split_once('@') {
            Some((username, domain)) => (username, Some(domain)),
            None => (handle, None),
        };

        let valid_username = !username.is_empty()
            && username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
        if !valid_username || domain.is_some_and(|d| d.is_empty() || d.contains('@')) {
            return Err(AppError::Validation(format!(
                "Invalid actor identifier: {}",
                raw
            )));
        }

        Ok(ActorIdentifier::Handle {
            username: username.to_string(),
            domain: domain.map(|d| d.trim_end_matches('.').to_ascii_lowercase()),
        })
    }
}

/// Resolves identifiers to actors, local store first
pub struct ActorResolver {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    discovery: DiscoveryClient,
    cache: ActorCache,
}

impl ActorResolver {
    pub fn new(config: Arc<AppConfig>, db: Arc<Database>, discovery: DiscoveryClient) -> Self {
        let cache = ActorCache::new(Duration::from_secs(
            config.federation.actor_cache_ttl_secs,
        ));
        Self {
            config,
            db,
            discovery,
            cache,
        }
    }

    pub fn discovery(&self) -> &DiscoveryClient {
        &self.discovery
    }

    pub fn cache(&self) -> &ActorCache {
        &self.cache
    }

    /// Resolve any supported identifier form
    pub async fn resolve(&self, identifier: &str) -> Result<Actor, AppError> {
        match ActorIdentifier::parse(identifier)? {
            ActorIdentifier::Url(url) => self.resolve_url(url.as_str()).await,
            ActorIdentifier::Handle { username, domain } => {
                self.resolve_handle(&username, domain.as_deref()).await
            }
        }
    }

    /// Resolve `username[@domain]`; no domain means this server
    pub async fn resolve_handle(
        &self,
        username: &str,
        domain: Option<&str>,
    ) -> Result<Actor, AppError> {
        match domain {
            None => self.local(username).await,
            Some(domain) if self.config.server.is_local_domain(domain) => {
                self.local(username).await
            }
            Some(domain) => {
                let document = self.discovery.discover(username, domain).await?;
                let actor = self.remember(document).await?;
                Ok(Actor::Remote(actor))
            }
        }
    }

    /// Resolve a canonical actor URL
    ///
    /// Remote actors are served from the TTL cache when fresh; otherwise the
    /// document is fetched, falling back to the stored projection if the
    /// remote server is unreachable.
    pub async fn resolve_url(&self, actor_url: &str) -> Result<Actor, AppError> {
        let parsed = url::Url::parse(actor_url)
            .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

        if let Some(username) = self.local_username_from_url(&parsed) {
            return self.local(&username).await;
        }
        if authority_of(&parsed).is_some_and(|a| self.config.server.is_local_domain(&a)) {
            return Err(AppError::NotFound("actor".to_string()));
        }

        if let Some(cached) = self.cache.get(actor_url).await {
            return Ok(Actor::Remote(cached));
        }

        match self.discovery.fetch_actor(actor_url).await {
            Ok(document) => Ok(Actor::Remote(self.remember(document).await?)),
            Err(error) => match self.db.get_remote_actor(actor_url).await? {
                Some(stored) => {
                    tracing::warn!(
                        actor = actor_url,
                        %error,
                        "Actor fetch failed, using stored projection"
                    );
                    Ok(Actor::Remote(stored))
                }
                None => Err(error),
            },
        }
    }

    /// Local actor URL for `username`, without touching the store
    pub fn local_actor_url(&self, username: &str) -> String {
        self.config.server.actor_url(username)
    }

    /// `/users/<handle>` on this server's domain, if `url` is one
    pub fn local_username_from_url(&self, url: &url::Url) -> Option<String> {
        let authority = authority_of(url)?;
        if !self.config.server.is_local_domain(&authority) {
            return None;
        }

        let path = url.path().trim_end_matches('/');
        let username = path.strip_prefix("/users/")?;
        if username.is_empty() || username.contains('/') {
            return None;
        }
        Some(username.to_string())
    }

    async fn local(&self, username: &str) -> Result<Actor, AppError> {
        let actor = self
            .db
            .get_local_actor(username)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("actor {}", username)))?;
        Ok(Actor::Local {
            url: self.config.server.actor_url(&actor.username),
            actor,
        })
    }

    async fn remember(&self, document: ActorDocument) -> Result<RemoteActor, AppError> {
        let actor = project_remote_actor(document)?;
        self.db.upsert_remote_actor(&actor).await?;
        self.cache.insert(actor.clone()).await;
        tracing::debug!(actor = %actor.uri, "Resolved remote actor");
        Ok(actor)
    }
}

/// Normalize a fetched actor document into the stored projection
pub fn project_remote_actor(document: ActorDocument) -> Result<RemoteActor, AppError> {
    let id = url::Url::parse(&document.id)
        .map_err(|e| AppError::Federation(format!("Invalid actor id: {}", e)))?;
    let domain = authority_of(&id)
        .ok_or_else(|| AppError::Federation("Actor id has no host".to_string()))?;
    let username = document
        .preferred_username
        .clone()
        .filter(|name| !name.is_empty())
        .or_else(|| {
            id.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .unwrap_or_default();

    Ok(RemoteActor {
        uri: document.id,
        username,
        domain,
        display_name: document.name,
        summary: document.summary,
        inbox_uri: document.inbox,
        outbox_uri: document.outbox,
        followers_uri: document.followers,
        following_uri: document.following,
        public_key_id: document.public_key.id,
        public_key_pem: document.public_key.public_key_pem,
        fetched_at: Utc::now(),
    })
}
