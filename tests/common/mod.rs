//! Common test utilities for E2E tests
//!
//! `TestServer` runs the full router on an ephemeral port; `MockRemote` is a
//! second, minimal ActivityPub server with its own key pair that the gateway
//! can discover, fetch from and deliver to.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use fedigate::federation::{
    ACTIVITY_JSON, AesGcmKeyVault, JRD_JSON, PublicKeyBlock, SignatureHeaders, generate_key_pair,
    generate_webfinger_response, sign_request, unseal_private_key,
};
use fedigate::{AppState, config};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const SERVICE_SECRET: &str = "test-service-secret-with-at-least-32-bytes";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub domain: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_page_size(10).await
    }

    pub async fn with_page_size(outbox_page_size: u32) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind first so the configured domain carries the real port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let domain = addr.to_string();

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: domain.clone(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            federation: config::FederationConfig {
                remote_scheme: "http".to_string(),
                fetch_timeout_secs: 5,
                delivery_timeout_secs: 5,
                outbox_page_size,
                actor_cache_ttl_secs: 60,
                allow_private_addresses: true,
                max_concurrent_deliveries: 4,
                activity_retention_secs: 3600,
            },
            internal: config::InternalAuthConfig {
                service_secret: SERVICE_SECRET.to_string(),
                token_ttl_secs: 600,
            },
            keys: config::KeyConfig {
                vault_key: BASE64_STANDARD.encode([7_u8; 32]),
                rsa_bits: 1024,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        fedigate::metrics::init_metrics();

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let app = fedigate::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            domain,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn actor_url(&self, username: &str) -> String {
        self.url(&format!("/users/{}", username))
    }

    /// Fresh service token for the internal API
    pub fn token(&self) -> String {
        fedigate::auth::issue_token(SERVICE_SECRET, 600).unwrap()
    }

    /// POST to the internal API with a valid token
    pub async fn internal_post(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .bearer_auth(self.token())
            .json(body)
            .send()
            .await
            .unwrap()
    }

    /// DELETE on the internal API with a JSON body
    pub async fn internal_delete(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .delete(self.url(path))
            .bearer_auth(self.token())
            .json(body)
            .send()
            .await
            .unwrap()
    }

    pub async fn internal_get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .bearer_auth(self.token())
            .send()
            .await
            .unwrap()
    }

    /// Activate a local actor through the internal API
    pub async fn create_actor(&self, username: &str) -> Value {
        let response = self
            .internal_post("/internal/actors", &json!({ "username": username }))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        response.json().await.unwrap()
    }

    /// Create a local post through the internal API
    pub async fn create_post(&self, username: &str, content: &str) -> Value {
        let response = self
            .internal_post(
                "/internal/posts",
                &json!({ "username": username, "content": content }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        response.json().await.unwrap()
    }
}

/// An activity the mock remote received on its inbox
#[derive(Debug, Clone)]
pub struct ReceivedActivity {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ReceivedActivity {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

struct MockState {
    username: String,
    domain: String,
    actor_url: String,
    public_key_pem: String,
    received: Mutex<Vec<ReceivedActivity>>,
    outbox: Mutex<Vec<Value>>,
    notes: Mutex<HashMap<String, Value>>,
    inbox_status: Mutex<StatusCode>,
    inbox_delay: Mutex<Duration>,
    claimed_actor_id: Mutex<Option<String>>,
    webfinger_self_link: Mutex<bool>,
}

/// Minimal remote ActivityPub server with one actor
pub struct MockRemote {
    pub addr: String,
    pub domain: String,
    pub actor_url: String,
    pub key_id: String,
    private_key_pem: String,
    state: Arc<MockState>,
    client: reqwest::Client,
}

impl MockRemote {
    pub async fn start(username: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let domain = listener.local_addr().unwrap().to_string();
        let addr = format!("http://{}", domain);
        let actor_url = format!("{}/users/{}", addr, username);

        let vault = AesGcmKeyVault::new(&[3_u8; 32]).unwrap();
        let key_pair = generate_key_pair(&vault, 1024).unwrap();
        let private_key_pem = unseal_private_key(&vault, &key_pair.encrypted_private_key_pem)
            .unwrap()
            .as_str()
            .to_string();

        let state = Arc::new(MockState {
            username: username.to_string(),
            domain: domain.clone(),
            actor_url: actor_url.clone(),
            public_key_pem: key_pair.public_key_pem,
            received: Mutex::new(Vec::new()),
            outbox: Mutex::new(Vec::new()),
            notes: Mutex::new(HashMap::new()),
            inbox_status: Mutex::new(StatusCode::ACCEPTED),
            inbox_delay: Mutex::new(Duration::ZERO),
            claimed_actor_id: Mutex::new(None),
            webfinger_self_link: Mutex::new(true),
        });

        let actor_path = format!("/users/{}", username);
        let app = Router::new()
            .route("/.well-known/webfinger", get(mock_webfinger))
            .route(&actor_path, get(mock_actor))
            .route(&format!("{}/inbox", actor_path), post(mock_inbox))
            .route("/inbox", post(mock_inbox))
            .route(&format!("{}/outbox", actor_path), get(mock_outbox))
            .route(&format!("{}/notes/:id", actor_path), get(mock_note))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            domain,
            key_id: format!("{}#main-key", actor_url),
            actor_url,
            private_key_pem,
            state,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Handle in `user@domain` form
    pub fn handle(&self) -> String {
        format!("{}@{}", self.state.username, self.domain)
    }

    /// Publish a Note; it is served at its id and listed in the outbox
    pub fn publish_note(&self, id_suffix: &str, content: &str) -> String {
        let note_id = format!("{}/notes/{}", self.actor_url, id_suffix);
        let note = json!({
            "id": note_id,
            "type": "Note",
            "attributedTo": self.actor_url,
            "content": content,
            "published": "2025-01-01T00:00:00Z",
        });
        self.state
            .notes
            .lock()
            .unwrap()
            .insert(id_suffix.to_string(), note.clone());
        self.state.outbox.lock().unwrap().insert(
            0,
            json!({
                "id": format!("{}/activity", note_id),
                "type": "Create",
                "actor": self.actor_url,
                "object": note,
            }),
        );
        note_id
    }

    /// Status the inbox answers with; deliveries are still recorded
    pub fn set_inbox_status(&self, status: StatusCode) {
        *self.state.inbox_status.lock().unwrap() = status;
    }

    /// Hold every inbox response for `delay`
    pub fn set_inbox_delay(&self, delay: Duration) {
        *self.state.inbox_delay.lock().unwrap() = delay;
    }

    /// Serve the actor document with a different `id`
    pub fn claim_actor_id(&self, id: &str) {
        *self.state.claimed_actor_id.lock().unwrap() = Some(id.to_string());
    }

    /// Drop the `self` link from WebFinger answers
    pub fn drop_webfinger_self_link(&self) {
        *self.state.webfinger_self_link.lock().unwrap() = false;
    }

    pub fn received(&self) -> Vec<ReceivedActivity> {
        self.state.received.lock().unwrap().clone()
    }

    /// Wait until at least `count` activities arrived
    pub async fn wait_for_activities(&self, count: usize) -> Vec<ReceivedActivity> {
        for _ in 0..100 {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.received()
    }

    /// Activity id under this remote's namespace
    pub fn activity_id(&self, suffix: &str) -> String {
        format!("{}/activities/{}", self.actor_url, suffix)
    }

    /// Sign and POST `activity` the way a federating server would
    pub async fn deliver(&self, inbox_url: &str, activity: &Value) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        self.deliver_raw(inbox_url, body).await
    }

    pub async fn deliver_raw(&self, inbox_url: &str, body: Vec<u8>) -> reqwest::Response {
        let headers = self.sign(inbox_url, &body);
        self.send_signed(inbox_url, headers, body).await
    }

    /// Signature headers for a POST of `body` to `url`
    pub fn sign(&self, url: &str, body: &[u8]) -> SignatureHeaders {
        sign_request("POST", url, Some(body), &self.private_key_pem, &self.key_id).unwrap()
    }

    /// POST `body` with previously computed signature headers
    pub async fn send_signed(
        &self,
        inbox_url: &str,
        headers: SignatureHeaders,
        body: Vec<u8>,
    ) -> reqwest::Response {
        let mut request = self
            .client
            .post(inbox_url)
            .header(header::CONTENT_TYPE, ACTIVITY_JSON)
            .header("Date", headers.date)
            .header("Signature", headers.signature);
        if let Some(digest) = headers.digest {
            request = request.header("Digest", digest);
        }
        request.body(body).send().await.unwrap()
    }
}

async fn mock_webfinger(
    State(state): State<Arc<MockState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let expected = format!("acct:{}@{}", state.username, state.domain);
    if query.get("resource") != Some(&expected) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let mut jrd = generate_webfinger_response(&state.username, &state.domain, &state.actor_url);
    if !*state.webfinger_self_link.lock().unwrap() {
        jrd.links.retain(|link| link.rel != "self");
    }
    ([(header::CONTENT_TYPE, JRD_JSON)], Json(jrd)).into_response()
}

async fn mock_actor(State(state): State<Arc<MockState>>) -> Response {
    let id = state
        .claimed_actor_id
        .lock()
        .unwrap()
        .clone()
        .unwrap_or_else(|| state.actor_url.clone());
    let document = json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": id,
        "type": "Person",
        "preferredUsername": state.username,
        "name": "Remote Bob",
        "inbox": format!("{}/inbox", state.actor_url),
        "outbox": format!("{}/outbox", state.actor_url),
        "followers": format!("{}/followers", state.actor_url),
        "publicKey": PublicKeyBlock::for_actor(&state.actor_url, &state.public_key_pem),
    });
    ([(header::CONTENT_TYPE, ACTIVITY_JSON)], Json(document)).into_response()
}

async fn mock_inbox(
    State(state): State<Arc<MockState>>,
    uri: axum::http::Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.received.lock().unwrap().push(ReceivedActivity {
        path: uri.path().to_string(),
        headers,
        body,
    });
    let delay = *state.inbox_delay.lock().unwrap();
    tokio::time::sleep(delay).await;
    let status = *state.inbox_status.lock().unwrap();
    status
}

/// Summary points at a page URL so clients must follow `first`
async fn mock_outbox(
    State(state): State<Arc<MockState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let outbox_url = format!("{}/outbox", state.actor_url);
    let items = state.outbox.lock().unwrap().clone();

    let document = if query.get("page").map(String::as_str) == Some("true") {
        json!({
            "id": format!("{}?page=true", outbox_url),
            "type": "OrderedCollectionPage",
            "partOf": outbox_url,
            "orderedItems": items,
        })
    } else {
        json!({
            "id": outbox_url,
            "type": "OrderedCollection",
            "totalItems": items.len(),
            "first": format!("{}?page=true", outbox_url),
        })
    };
    ([(header::CONTENT_TYPE, ACTIVITY_JSON)], Json(document)).into_response()
}

async fn mock_note(
    State(state): State<Arc<MockState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Response {
    match state.notes.lock().unwrap().get(&id).cloned() {
        Some(note) => ([(header::CONTENT_TYPE, ACTIVITY_JSON)], Json(note)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
