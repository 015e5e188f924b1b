//! WebFinger protocol implementation
//!
//! Serves JRD documents for local actors and discovers remote actors:
//! `acct:` lookup, `rel="self"` link selection, then an unsigned fetch of
//! the actor document. There is no internal retry; the first failure is
//! returned.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::guard::check_outbound_url;
use super::keys::PublicKeyBlock;
use crate::config::FederationConfig;
use crate::error::AppError;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

pub const ACTIVITY_JSON: &str = "application/activity+json";
pub const LD_JSON_PROFILE: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
pub const JRD_JSON: &str = "application/jrd+json";

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl WebFingerResponse {
    /// The `rel="self"` href, preferring an ActivityStreams media type
    pub fn self_link(&self) -> Option<&str> {
        let self_links = || {
            self.links
                .iter()
                .filter(|link| link.rel == "self" && link.href.is_some())
        };

        self_links()
            .find(|link| {
                link.link_type.as_deref().is_some_and(|media_type| {
                    media_type == ACTIVITY_JSON || media_type.starts_with("application/ld+json")
                })
            })
            .or_else(|| self_links().next())
            .and_then(|link| link.href.as_deref())
    }
}

/// Generate WebFinger response for a local account.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `actor_url` - Canonical actor URL
pub fn generate_webfinger_response(
    username: &str,
    domain: &str,
    actor_url: &str,
) -> WebFingerResponse {
    WebFingerResponse {
        subject: Some(format!("acct:{}@{}", username, domain)),
        aliases: Some(vec![actor_url.to_string()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(ACTIVITY_JSON.to_string()),
            href: Some(actor_url.to_string()),
        }],
    }
}

/// Split an `acct:user@domain` resource
///
/// Both parts must be non-empty.
pub fn parse_acct_resource(resource: &str) -> Result<(String, String), AppError> {
    let account = resource
        .strip_prefix("acct:")
        .ok_or_else(|| AppError::Validation("resource must use the acct: scheme".to_string()))?;
    let (username, domain) = account
        .trim_start_matches('@')
        .split_once('@')
        .ok_or_else(|| AppError::Validation("resource must be acct:user@domain".to_string()))?;

    if username.is_empty() || domain.is_empty() {
        return Err(AppError::Validation(
            "resource must be acct:user@domain".to_string(),
        ));
    }

    Ok((username.to_string(), domain.to_ascii_lowercase()))
}

/// Actor document as published on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDocument {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub id: String,
    #[serde(rename = "type", default)]
    pub actor_type: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub inbox: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liked: Option<String>,
    pub public_key: PublicKeyBlock,
}

/// Outbound discovery and remote document fetches
#[derive(Clone)]
pub struct DiscoveryClient {
    http_client: reqwest::Client,
    remote_scheme: String,
    allow_private: bool,
    timeout: Duration,
}

impl DiscoveryClient {
    pub fn new(http_client: reqwest::Client, config: &FederationConfig) -> Self {
        Self {
            http_client,
            remote_scheme: config.remote_scheme.clone(),
            allow_private: config.allow_private_addresses,
            timeout: Duration::from_secs(config.fetch_timeout_secs),
        }
    }

    /// WebFinger lookup, then actor document fetch
    pub async fn discover(&self, username: &str, domain: &str) -> Result<ActorDocument, AppError> {
        let actor_url = self.webfinger(username, domain).await?;
        self.fetch_actor(&actor_url).await
    }

    /// Resolve `username@domain` to the actor URL advertised by its server
    pub async fn webfinger(&self, username: &str, domain: &str) -> Result<String, AppError> {
        let mut url = url::Url::parse(&format!(
            "{}://{}/.well-known/webfinger",
            self.remote_scheme, domain
        ))
        .map_err(|e| AppError::Validation(format!("Invalid domain {}: {}", domain, e)))?;
        url.query_pairs_mut()
            .append_pair("resource", &format!("acct:{}@{}", username, domain));

        let value = self
            .get_json(url.as_str(), &format!("{}, application/json", JRD_JSON), "webfinger")
            .await?;
        let jrd: WebFingerResponse = serde_json::from_value(value)
            .map_err(|e| AppError::Federation(format!("Malformed WebFinger response: {}", e)))?;

        if let Some(subject) = jrd.subject.as_deref() {
            let subject_domain = subject
                .strip_prefix("acct:")
                .and_then(|acct| acct.rsplit_once('@'))
                .map(|(_, subject_domain)| subject_domain);
            if let Some(subject_domain) = subject_domain {
                if !subject_domain.eq_ignore_ascii_case(domain) {
                    return Err(AppError::Federation(format!(
                        "WebFinger subject {} does not belong to {}",
                        subject, domain
                    )));
                }
            }
        }

        jrd.self_link().map(str::to_string).ok_or_else(|| {
            AppError::Federation(format!(
                "WebFinger response for {}@{} has no self link",
                username, domain
            ))
        })
    }

    /// Fetch and decode an actor document
    ///
    /// The document's `id` must name the URL it was fetched from.
    pub async fn fetch_actor(&self, actor_url: &str) -> Result<ActorDocument, AppError> {
        let requested = canonical_resource(actor_url)
            .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

        let value = self
            .get_json(actor_url, &format!("{}, {}", ACTIVITY_JSON, LD_JSON_PROFILE), "actor")
            .await?;
        let document: ActorDocument = serde_json::from_value(value)
            .map_err(|e| AppError::Federation(format!("Malformed actor document: {}", e)))?;

        let advertised = canonical_resource(&document.id)
            .map_err(|e| AppError::Federation(format!("Invalid actor id: {}", e)))?;
        if requested != advertised {
            return Err(AppError::Federation(format!(
                "Actor document at {} claims to be {}",
                actor_url, document.id
            )));
        }

        if document.public_key.owner != document.id {
            return Err(AppError::Federation(format!(
                "Public key of {} is owned by {}",
                document.id, document.public_key.owner
            )));
        }

        Ok(document)
    }

    /// Unsigned GET of a JSON document, after the outbound URL checks
    pub async fn get_json(
        &self,
        url: &str,
        accept: &str,
        kind: &'static str,
    ) -> Result<serde_json::Value, AppError> {
        let started = Instant::now();
        let result = self.get_json_inner(url, accept).await;

        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&[kind])
            .observe(started.elapsed().as_secs_f64());
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&[kind, if result.is_ok() { "success" } else { "error" }])
            .inc();

        if let Err(error) = &result {
            tracing::debug!(url, kind, %error, "Remote fetch failed");
        }
        result
    }

    async fn get_json_inner(&self, url: &str, accept: &str) -> Result<serde_json::Value, AppError> {
        let url = check_outbound_url(url, self.allow_private).await?;

        let response = self
            .http_client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, accept)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to fetch {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Failed to fetch {}: HTTP {}",
                url,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to parse {}: {}", url, e)))
    }
}

/// URL with fragment and trailing slash removed, for identity comparisons
fn canonical_resource(raw: &str) -> Result<String, url::ParseError> {
    let mut url = url::Url::parse(raw.trim())?;
    url.set_fragment(None);
    Ok(url.as_str().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_response_points_self_at_actor() {
        let jrd = generate_webfinger_response(
            "alice",
            "localhost:4000",
            "http://localhost:4000/users/alice",
        );
        assert_eq!(jrd.subject.as_deref(), Some("acct:alice@localhost:4000"));
        assert_eq!(jrd.self_link(), Some("http://localhost:4000/users/alice"));
    }

    #[test]
    fn self_link_prefers_activity_json() {
        let jrd: WebFingerResponse = serde_json::from_value(serde_json::json!({
            "subject": "acct:bob@remote.example",
            "links": [
                {"rel": "http://webfinger.net/rel/profile-page", "type": "text/html", "href": "https://remote.example/@bob"},
                {"rel": "self", "type": "text/html", "href": "https://remote.example/@bob"},
                {"rel": "self", "type": "application/activity+json", "href": "https://remote.example/users/bob"}
            ]
        }))
        .unwrap();

        assert_eq!(jrd.self_link(), Some("https://remote.example/users/bob"));
    }

    #[test]
    fn self_link_missing_is_none() {
        let jrd: WebFingerResponse = serde_json::from_value(serde_json::json!({
            "subject": "acct:bob@remote.example",
            "links": [{"rel": "http://webfinger.net/rel/profile-page", "href": "https://remote.example/@bob"}]
        }))
        .unwrap();

        assert!(jrd.self_link().is_none());
    }

    #[test]
    fn parse_acct_resource_splits_user_and_domain() {
        let (username, domain) = parse_acct_resource("acct:alice@Example.COM").unwrap();
        assert_eq!(username, "alice");
        assert_eq!(domain, "example.com");

        assert!(parse_acct_resource("alice@example.com").is_err());
        assert!(parse_acct_resource("acct:alice").is_err());
        assert!(parse_acct_resource("acct:@example.com").is_err());
    }

    /// Serve fixed JSON documents on an ephemeral port; returns the authority
    async fn serve_documents(documents: Vec<(&'static str, serde_json::Value)>) -> String {
        let mut app = axum::Router::new();
        for (path, document) in documents {
            app = app.route(
                path,
                axum::routing::get(move || {
                    let document = document.clone();
                    async move { axum::Json(document) }
                }),
            );
        }
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let authority = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        authority
    }

    fn actor_json(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "type": "Person",
            "preferredUsername": "bob",
            "inbox": format!("{id}/inbox"),
            "publicKey": {"id": format!("{id}#main-key"), "owner": id, "publicKeyPem": "PEM"}
        })
    }

    fn discovery_client() -> DiscoveryClient {
        let config = crate::config::tests::valid_config();
        DiscoveryClient::new(reqwest::Client::new(), &config.federation)
    }

    #[test]
    fn canonical_resource_ignores_fragment_and_trailing_slash() {
        assert_eq!(
            canonical_resource("https://Remote.Example/users/bob/#main-key").unwrap(),
            "https://remote.example/users/bob"
        );
        assert_ne!(
            canonical_resource("https://remote.example/users/bob").unwrap(),
            canonical_resource("https://remote.example/users/mallory").unwrap()
        );
    }

    #[tokio::test]
    async fn fetch_actor_requires_document_id_to_match_url() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let mallory = actor_json(&format!("{base}/users/mallory"));
        let carol = actor_json(&format!("{base}/users/carol/"));
        let app = axum::Router::new()
            .route(
                "/users/bob",
                axum::routing::get(move || {
                    let mallory = mallory.clone();
                    async move { axum::Json(mallory) }
                }),
            )
            .route(
                "/users/carol",
                axum::routing::get(move || {
                    let carol = carol.clone();
                    async move { axum::Json(carol) }
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = discovery_client();
        let spoofed = client.fetch_actor(&format!("{base}/users/bob")).await;
        assert!(
            matches!(&spoofed, Err(AppError::Federation(msg)) if msg.contains("claims to be")),
            "{spoofed:?}"
        );

        let carol = client.fetch_actor(&format!("{base}/users/carol")).await.unwrap();
        assert_eq!(carol.id, format!("{base}/users/carol/"));
    }

    #[tokio::test]
    async fn discover_without_self_link_is_a_federation_error() {
        let authority = serve_documents(vec![(
            "/.well-known/webfinger",
            serde_json::json!({
                "links": [{"rel": "http://webfinger.net/rel/profile-page", "href": "https://remote.example/@bob"}]
            }),
        )])
        .await;

        let result = discovery_client().discover("bob", &authority).await;
        assert!(
            matches!(&result, Err(AppError::Federation(msg)) if msg.contains("no self link")),
            "{result:?}"
        );
    }

    #[tokio::test]
    async fn discover_rejects_subject_on_another_domain() {
        let authority = serve_documents(vec![(
            "/.well-known/webfinger",
            serde_json::json!({
                "subject": "acct:bob@elsewhere.example",
                "links": [{"rel": "self", "type": ACTIVITY_JSON, "href": "https://elsewhere.example/users/bob"}]
            }),
        )])
        .await;

        let result = discovery_client().discover("bob", &authority).await;
        assert!(
            matches!(&result, Err(AppError::Federation(msg)) if msg.contains("does not belong")),
            "{result:?}"
        );
    }

    #[test]
    fn actor_document_round_trips_wire_names() {
        let document: ActorDocument = serde_json::from_value(serde_json::json!({
            "@context": ["https://www.w3.org/ns/activitystreams"],
            "id": "https://remote.example/users/bob",
            "type": "Person",
            "preferredUsername": "bob",
            "inbox": "https://remote.example/users/bob/inbox",
            "publicKey": {
                "id": "https://remote.example/users/bob#main-key",
                "owner": "https://remote.example/users/bob",
                "publicKeyPem": "PEM"
            }
        }))
        .unwrap();

        assert_eq!(document.preferred_username.as_deref(), Some("bob"));
        assert_eq!(document.public_key.public_key_pem, "PEM");
        assert!(document.outbox.is_none());
    }
}
