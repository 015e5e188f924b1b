//! Account service
//!
//! Activation and lookup of local actors, and the documents that publish
//! them to other servers.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::data::{Database, EntityId, LocalActor};
use crate::error::AppError;
use crate::federation::{AS_CONTEXT, ActorDocument, KeyVault, PublicKeyBlock, generate_key_pair};

fn normalize_optional_text(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn validate_username(username: &str) -> Result<(), AppError> {
    let valid = !username.is_empty()
        && username.len() <= 64
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(
            "username may only contain letters, digits, '_', '-' and '.'".to_string(),
        ))
    }
}

/// Account service
pub struct AccountService {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    key_vault: Arc<dyn KeyVault>,
}

impl AccountService {
    pub fn new(config: Arc<AppConfig>, db: Arc<Database>, key_vault: Arc<dyn KeyVault>) -> Self {
        Self {
            config,
            db,
            key_vault,
        }
    }

    /// Activate a local actor
    ///
    /// Generates the actor's key pair; the private half is sealed before it
    /// reaches the store.
    ///
    /// # Errors
    /// `Conflict` if the handle is taken, `Validation` for a bad handle
    pub async fn activate(
        &self,
        username: &str,
        display_name: Option<String>,
        summary: Option<String>,
    ) -> Result<LocalActor, AppError> {
        let username = username.trim();
        validate_username(username)?;

        // Fast-path guard before expensive key generation.
        if self.db.get_local_actor(username).await?.is_some() {
            return Err(AppError::Conflict(format!("actor {} already exists", username)));
        }

        let vault = self.key_vault.clone();
        let bits = self.config.keys.rsa_bits;
        let key_pair = tokio::task::spawn_blocking(move || generate_key_pair(vault.as_ref(), bits))
            .await
            .map_err(|e| AppError::Internal(e.into()))??;

        let now = chrono::Utc::now();
        let actor = LocalActor {
            id: EntityId::new().0,
            username: username.to_string(),
            display_name: normalize_optional_text(display_name),
            summary: normalize_optional_text(summary),
            public_key_pem: key_pair.public_key_pem,
            encrypted_private_key_pem: key_pair.encrypted_private_key_pem,
            activated: true,
            created_at: now,
            updated_at: now,
        };

        self.db.insert_local_actor(&actor).await?;
        tracing::info!(username = %actor.username, "Activated local actor");

        Ok(actor)
    }

    /// Get an activated local actor
    pub async fn get(&self, username: &str) -> Result<LocalActor, AppError> {
        self.db
            .get_local_actor(username)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("actor {}", username)))
    }

    /// Actor document served at `/users/:username`
    pub async fn actor_document(&self, username: &str) -> Result<ActorDocument, AppError> {
        let actor = self.get(username).await?;
        let actor_url = self.config.server.actor_url(&actor.username);

        Ok(ActorDocument {
            context: Some(serde_json::json!([AS_CONTEXT, "https://w3id.org/security/v1"])),
            id: actor_url.clone(),
            actor_type: Some("Person".to_string()),
            preferred_username: Some(actor.username.clone()),
            name: Some(actor.display_name.unwrap_or_else(|| actor.username.clone())),
            summary: actor.summary,
            inbox: format!("{}/inbox", actor_url),
            outbox: Some(format!("{}/outbox", actor_url)),
            followers: Some(format!("{}/followers", actor_url)),
            following: Some(format!("{}/following", actor_url)),
            liked: None,
            public_key: PublicKeyBlock::for_actor(&actor_url, &actor.public_key_pem),
        })
    }

    /// Actor URLs following the local actor
    pub async fn followers(&self, username: &str) -> Result<(String, Vec<String>), AppError> {
        let actor = self.get(username).await?;
        let actor_url = self.config.server.actor_url(&actor.username);
        let followers = self.db.get_follower_uris(&actor_url).await?;
        Ok((actor_url, followers))
    }

    /// Actor URLs the local actor follows
    pub async fn following(&self, username: &str) -> Result<(String, Vec<String>), AppError> {
        let actor = self.get(username).await?;
        let actor_url = self.config.server.actor_url(&actor.username);
        let following = self.db.get_following_uris(&actor_url).await?;
        Ok((actor_url, following))
    }
}
