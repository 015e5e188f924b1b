//! Fedigate - federation gateway for a small social network
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actor, inbox, outbox)             │
//! │  - WebFinger                                                │
//! │  - Internal content-service API                             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Service / Federation Layer                    │
//! │  - Inbox state machine, delivery, signatures                │
//! │  - Actor resolution and discovery                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Local-user operations
//! - `federation`: ActivityPub protocol handling
//! - `data`: Database layer
//! - `auth`: Service-to-service tokens
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

use federation::KeyVault;

/// Largest inbox or internal request body accepted
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// Cloned for each request; every field is a cheap handle.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Actor lookup (local store, cache, discovery)
    pub resolver: Arc<federation::ActorResolver>,

    /// Signed outbound deliveries
    pub delivery: Arc<federation::ActivityDelivery>,

    /// Seals and unseals actor private keys
    pub key_vault: Arc<dyn KeyVault>,

    /// Inbound activity state machine
    pub inbox: Arc<federation::InboxProcessor>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database (runs migrations)
    /// 2. Open the key vault
    /// 3. Build the shared HTTP client
    /// 4. Wire resolver, delivery and inbox processing
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!(path = %config.database.path.display(), "Database connected");

        let key_vault: Arc<dyn KeyVault> =
            Arc::new(federation::AesGcmKeyVault::from_config(&config.keys)?);

        // Per-request timeouts are set by the discovery and delivery clients.
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("Fedigate/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(config.federation.fetch_timeout_secs))
            .build()?;

        let config = Arc::new(config);
        let discovery = federation::DiscoveryClient::new(http_client.clone(), &config.federation);
        let resolver = Arc::new(federation::ActorResolver::new(
            config.clone(),
            db.clone(),
            discovery,
        ));
        let delivery = Arc::new(federation::ActivityDelivery::new(
            http_client,
            resolver.clone(),
            key_vault.clone(),
            &config.federation,
        ));
        let inbox = Arc::new(federation::InboxProcessor::new(db.clone(), resolver.clone()));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config,
            db,
            resolver,
            delivery,
            key_vault,
            inbox,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::{Router, extract::DefaultBodyLimit, middleware};
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .merge(api::internal_router(state.clone()))
        .merge(api::metrics_router())
        .route_layer(middleware::from_fn(api::track_http_metrics))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
