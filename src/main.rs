use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedsync::config::Config;
use feedsync::db::Database;
use feedsync::routes::{self, AppState};
use feedsync::transport::Transport;
use feedsync::updater::{start_background_sync, Updater};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feedsync=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path =
        std::env::var("FEEDSYNC_CONFIG").unwrap_or_else(|_| "feedsync.toml".to_string());
    let config = Config::load(&config_path)?;
    info!(
        "Loaded configuration from {} ({} configured feeds)",
        config_path,
        config.feeds.len()
    );

    // Initialize database
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| config.database_url.clone());
    let db = Database::new(&database_url).await?;
    db.initialize().await?;
    info!("Database initialized");

    let db = Arc::new(db);

    // Create updater
    let transport = Transport::new(&config.user_agent, config.request_timeout())?;
    let updater = Arc::new(Updater::new(
        db.clone(),
        transport,
        config.max_concurrent_fetches,
    ));

    let seeded = updater.seed_subscriptions(&config.feeds).await;
    if seeded > 0 {
        info!("Subscribed to {} configured feeds", seeded);
    }

    // Start background sync task
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_task = tokio::spawn(start_background_sync(
        updater.clone(),
        config.refresh_every(),
        shutdown_rx,
    ));

    // Create app state
    let state = Arc::new(AppState {
        db: db.clone(),
        updater: updater.clone(),
    });

    // Build router
    let app = Router::new()
        .route("/health", get(routes::health))
        .route("/refresh", post(routes::refresh))
        .route("/refresh/status", get(routes::refresh_status))
        .route("/feeds", post(routes::create_feed))
        .route("/feeds/:id", delete(routes::delete_feed))
        .route("/feeds/:id/refresh", post(routes::refresh_feed))
        .route("/feeds/:id/entries", get(routes::feed_entries))
        .route("/entries/:id/read", post(routes::read_entry))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Server starting on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    sync_task.await?;

    Ok(())
}
