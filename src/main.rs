use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wordcloud::{
    abuse, api, auth, broadcast, config::RoomConfig, state::AppState, store::MemoryStore,
};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wordcloud=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting word cloud service...");

    let config = RoomConfig::from_env();
    let auth_config = Arc::new(auth::AuthConfig::from_env());
    let abuse_config = Arc::new(abuse::AbuseConfig::from_env());

    let store = match &config.snapshot_path {
        Some(path) => Arc::new(
            MemoryStore::open(path)
                .await
                .expect("Failed to load store snapshot"),
        ),
        None => {
            tracing::warn!("WORDCLOUD_SNAPSHOT_PATH not set, rooms live in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let addr = config.bind_addr;
    let snapshot_interval = config.snapshot_interval;
    let state = Arc::new(AppState::new(store.clone(), config));

    broadcast::spawn_cleanup_scheduler(state.clone());
    broadcast::spawn_snapshot_writer(store.clone(), snapshot_interval);
    if let Some(limiter) = &abuse_config.rate_limiter {
        broadcast::spawn_rate_limit_janitor(limiter.clone());
    }

    let app = api::router(state, auth_config, abuse_config)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listen address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    if let Err(e) = store.persist().await {
        tracing::error!(error = %e, "Failed to write final store snapshot");
    }
    tracing::info!("Shut down");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
