//! Fedigate binary entry point

use std::time::Duration;

use fedigate::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState
/// 4. Build Axum router
/// 5. Start background tasks (actor cache and activity ledger pruning)
/// 6. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("FEDIGATE__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "fedigate=info,tower_http=debug".into());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Fedigate...");

    // 2. Initialize metrics
    fedigate::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;

    // 5. Build Axum router
    let app = fedigate::build_router(state.clone());

    // 6. Start background tasks
    spawn_maintenance(state.clone());

    // 7. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodic housekeeping
///
/// Drops expired entries from the remote actor cache and forgets applied
/// inbound activity ids older than `federation.activity_retention_secs`.
fn spawn_maintenance(state: AppState) {
    let period = Duration::from_secs(state.config.federation.actor_cache_ttl_secs.clamp(60, 3600));
    // Capped at ten years so the cutoff arithmetic cannot overflow.
    let retention_secs = state.config.federation.activity_retention_secs.min(10 * 365 * 86_400);
    let retention = chrono::Duration::seconds(retention_secs as i64);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick fires immediately and there is nothing to prune yet.
        interval.tick().await;

        loop {
            interval.tick().await;
            let pruned = state.resolver.cache().prune_expired().await;
            if pruned > 0 {
                tracing::debug!(pruned, "Pruned expired actor cache entries");
            }

            match state
                .db
                .prune_processed_activities(chrono::Utc::now() - retention)
                .await
            {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Pruned inbound activity ledger"),
                Err(error) => tracing::warn!(%error, "Failed to prune inbound activity ledger"),
            }
        }
    });

    tracing::info!("Maintenance task spawned");
}
