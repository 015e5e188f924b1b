//! Activity delivery
//!
//! Signs activities with a local actor's key and POSTs them to remote
//! inboxes. Every POST holds a permit from one shared semaphore, so at most
//! `federation.max_concurrent_deliveries` are in flight. Failures are logged
//! and counted; nothing is retried.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;

use super::activity::AcceptTask;
use super::guard::check_outbound_url;
use super::keys::{KeyVault, main_key_id, unseal_private_key};
use super::resolver::{Actor, ActorResolver};
use super::webfinger::ACTIVITY_JSON;
use crate::config::FederationConfig;
use crate::data::{EntityId, LocalActor};
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_SENT, FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

/// Identity an outbound request is signed as
#[derive(Debug, Clone)]
pub struct LocalSigner {
    pub actor_url: String,
    pub key_id: String,
    encrypted_private_key_pem: String,
}

impl LocalSigner {
    pub fn new(actor_url: &str, actor: &LocalActor) -> Self {
        Self {
            actor_url: actor_url.to_string(),
            key_id: main_key_id(actor_url),
            encrypted_private_key_pem: actor.encrypted_private_key_pem.clone(),
        }
    }

    /// Mint a fresh activity id under this actor
    pub fn activity_id(&self, kind: &str) -> String {
        format!("{}/{}/{}", self.actor_url, kind, EntityId::new().0.to_lowercase())
    }
}

/// Activity delivery service
#[derive(Clone)]
pub struct ActivityDelivery {
    http_client: reqwest::Client,
    resolver: Arc<ActorResolver>,
    key_vault: Arc<dyn KeyVault>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    allow_private: bool,
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
fn unique_inbox_targets(inbox_uris: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    inbox_uris
        .into_iter()
        .filter(|inbox_uri| seen.insert(inbox_uri.clone()))
        .collect()
}

fn activity_type(activity: &Value) -> String {
    activity
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string()
}

impl ActivityDelivery {
    pub fn new(
        http_client: reqwest::Client,
        resolver: Arc<ActorResolver>,
        key_vault: Arc<dyn KeyVault>,
        config: &FederationConfig,
    ) -> Self {
        Self {
            http_client,
            resolver,
            key_vault,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_deliveries.max(1))),
            timeout: Duration::from_secs(config.delivery_timeout_secs),
            allow_private: config.allow_private_addresses,
        }
    }

    /// Signing identity for a resolved local actor
    pub fn signer_for(&self, actor: &Actor) -> Result<LocalSigner, AppError> {
        match actor {
            Actor::Local { url, actor } => Ok(LocalSigner::new(url, actor)),
            Actor::Remote(remote) => Err(AppError::Validation(format!(
                "{} is not a local actor",
                remote.uri
            ))),
        }
    }

    /// Deliver activity to a single inbox
    ///
    /// Waits for a delivery permit first.
    ///
    /// # Errors
    /// Returns error if delivery fails (network, signature, rejection)
    pub async fn deliver_to_inbox(
        &self,
        signer: &LocalSigner,
        inbox_uri: &str,
        activity: &Value,
    ) -> Result<(), AppError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| AppError::Internal(anyhow::anyhow!("delivery pool closed")))?;

        let kind = activity_type(activity);
        let started = Instant::now();
        let result = self.post_signed(signer, inbox_uri, activity).await;

        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["delivery"])
            .observe(started.elapsed().as_secs_f64());
        let outcome = if result.is_ok() { "success" } else { "error" };
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["delivery", outcome])
            .inc();
        ACTIVITIES_SENT.with_label_values(&[kind.as_str(), outcome]).inc();

        match &result {
            Ok(()) => tracing::info!(inbox = inbox_uri, activity_type = %kind, "Delivered activity"),
            Err(error) => tracing::warn!(
                inbox = inbox_uri,
                activity_type = %kind,
                %error,
                "Activity delivery failed"
            ),
        }
        result
    }

    async fn post_signed(
        &self,
        signer: &LocalSigner,
        inbox_uri: &str,
        activity: &Value,
    ) -> Result<(), AppError> {
        let inbox = check_outbound_url(inbox_uri, self.allow_private).await?;
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;

        let sig_headers = {
            let private_key_pem =
                unseal_private_key(self.key_vault.as_ref(), &signer.encrypted_private_key_pem)?;
            super::signature::sign_request(
                "POST",
                inbox.as_str(),
                Some(&body),
                &private_key_pem,
                &signer.key_id,
            )?
        };

        let mut request = self
            .http_client
            .post(inbox.clone())
            .header(reqwest::header::CONTENT_TYPE, ACTIVITY_JSON)
            .header(reqwest::header::ACCEPT, ACTIVITY_JSON)
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature)
            .timeout(self.timeout);
        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to deliver to {}: {}", inbox, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox,
                response.status()
            )));
        }
        Ok(())
    }

    /// Resolve `actor_url` and deliver to its inbox
    pub async fn deliver_to_actor(
        &self,
        signer: &LocalSigner,
        actor_url: &str,
        activity: &Value,
    ) -> Result<(), AppError> {
        let target = self.resolver.resolve_url(actor_url).await?;
        self.deliver_to_inbox(signer, &target.inbox(), activity).await
    }

    /// Fan an activity out to many inboxes and wait for every outcome
    ///
    /// Identical inbox URIs are contacted once.
    pub async fn deliver_to_many(
        &self,
        signer: &LocalSigner,
        activity: Value,
        inbox_uris: Vec<String>,
    ) -> Vec<DeliveryResult> {
        let total_targets = inbox_uris.len();
        let delivery_targets = unique_inbox_targets(inbox_uris);

        tracing::info!(
            unique = delivery_targets.len(),
            total = total_targets,
            "Delivering activity"
        );

        let activity = Arc::new(activity);
        let signer = Arc::new(signer.clone());
        let mut tasks = Vec::with_capacity(delivery_targets.len());

        for inbox_uri in delivery_targets {
            let activity = activity.clone();
            let signer = signer.clone();
            let this = self.clone();

            tasks.push(tokio::spawn(async move {
                let result = this.deliver_to_inbox(&signer, &inbox_uri, &activity).await;

                DeliveryResult {
                    inbox_uri,
                    success: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                }
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for joined in futures::future::join_all(tasks).await {
            match joined {
                Ok(result) => results.push(result),
                Err(error) => tracing::error!(%error, "Delivery task panicked"),
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        tracing::info!(
            succeeded = success_count,
            failed = results.len() - success_count,
            "Batch delivery complete"
        );

        results
    }

    /// Queue one activity for an inbox and return immediately
    ///
    /// The outcome is logged and counted by [`Self::deliver_to_inbox`].
    pub fn spawn_to_inbox(&self, signer: LocalSigner, inbox_uri: String, activity: Value) {
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.deliver_to_inbox(&signer, &inbox_uri, &activity).await;
        });
    }

    /// Queue an activity for many inboxes and return immediately
    ///
    /// Returns the number of distinct inboxes queued.
    pub fn spawn_to_many(&self, signer: LocalSigner, activity: Value, inbox_uris: Vec<String>) -> usize {
        let targets = unique_inbox_targets(inbox_uris);
        let queued = targets.len();
        if queued > 0 {
            let this = self.clone();
            tokio::spawn(async move {
                this.deliver_to_many(&signer, activity, targets).await;
            });
        }
        queued
    }

    /// Send the Accept for an inbound Follow
    pub async fn send_accept(&self, task: &AcceptTask) -> Result<(), AppError> {
        let local = self.resolver.resolve_url(&task.local_actor_url).await?;
        let signer = self.signer_for(&local)?;
        let accept = builder::accept(
            &signer.activity_id("accept"),
            &signer.actor_url,
            task.follow_activity.clone(),
        );
        self.deliver_to_actor(&signer, &task.follower_url, &accept).await
    }

    /// Fire-and-forget Accept; the outcome is only logged
    pub fn spawn_accept(&self, task: AcceptTask) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(error) = this.send_accept(&task).await {
                tracing::warn!(
                    follower = %task.follower_url,
                    local_actor = %task.local_actor_url,
                    %error,
                    "Accept delivery failed"
                );
            }
        });
    }
}

/// Result of a delivery attempt
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Target inbox URI
    pub inbox_uri: String,
    /// Whether delivery succeeded
    pub success: bool,
    /// Error message if failed
    pub error: Option<String>,
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    use crate::federation::activity::{AS_CONTEXT, AS_PUBLIC};

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept activity wrapping the accepted activity
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity
    pub fn create(id: &str, actor: &str, object: Value, published: &str) -> Value {
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": [AS_PUBLIC],
            "cc": [format!("{}/followers", actor)],
            "published": published
        })
    }

    /// Build a Like activity
    pub fn like(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Like",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Undo activity
    ///
    /// `object` is the full activity being reverted, not just its id.
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": AS_CONTEXT,
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Note object
    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        published: &str,
        in_reply_to: Option<&str>,
    ) -> Value {
        serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "published": published,
            "inReplyTo": in_reply_to,
            "to": [AS_PUBLIC],
            "cc": [format!("{}/followers", attributed_to)]
        })
    }
}
