//! Remote actor caching
//!
//! Keeps recently resolved remote actors in memory, keyed by canonical
//! actor URL only. Handle lookups always go through discovery.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::data::RemoteActor;
use crate::metrics::{ACTOR_CACHE_HITS, ACTOR_CACHE_MISSES, ACTOR_CACHE_SIZE};

#[derive(Debug, Clone)]
struct CachedActor {
    actor: RemoteActor,
    cached_at: Instant,
}

/// TTL cache of remote actor projections
pub struct ActorCache {
    entries: RwLock<HashMap<String, CachedActor>>,
    ttl: Duration,
}

impl ActorCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Cached actor for `url`, if present and fresh
    pub async fn get(&self, url: &str) -> Option<RemoteActor> {
        let entries = self.entries.read().await;
        match entries.get(url) {
            Some(cached) if cached.cached_at.elapsed() < self.ttl => {
                ACTOR_CACHE_HITS.inc();
                tracing::debug!(actor = url, "Actor cache hit");
                Some(cached.actor.clone())
            }
            _ => {
                ACTOR_CACHE_MISSES.inc();
                None
            }
        }
    }

    pub async fn insert(&self, actor: RemoteActor) {
        let mut entries = self.entries.write().await;
        entries.insert(
            actor.uri.clone(),
            CachedActor {
                actor,
                cached_at: Instant::now(),
            },
        );
        ACTOR_CACHE_SIZE.set(entries.len() as i64);
    }

    /// Drop an entry, e.g. after its key failed to verify
    pub async fn invalidate(&self, url: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(url);
        ACTOR_CACHE_SIZE.set(entries.len() as i64);
        tracing::debug!(actor = url, "Invalidated actor cache entry");
    }

    /// Remove expired entries, returning how many were dropped
    pub async fn prune_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, cached| cached.cached_at.elapsed() < self.ttl);
        let removed = before - entries.len();
        ACTOR_CACHE_SIZE.set(entries.len() as i64);

        if removed > 0 {
            tracing::info!(removed, "Pruned expired actor cache entries");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
