//! services/sync/src/bin/sync.rs

use spirit_core::ports::{RemoteStore, ScrapeService};
use spirit_core::{FeedDeps, MatchFeed, SessionStore};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use sync_lib::{
    adapters::{DbAdapter, FileSessionAdapter, HttpScrapeAdapter, WebhookHub},
    config::Config,
    error::SyncError,
    web::{router, state::AppState},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), SyncError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting sync service...");

    // --- 2. Connect to the Backend Database ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let store: Arc<dyn RemoteStore> = Arc::new(DbAdapter::new(db_pool));

    // --- 3. Initialize Adapters ---
    let persistence = Arc::new(FileSessionAdapter::new(config.session_path.clone()));
    let hub = WebhookHub::new();
    let scrape: Option<Arc<dyn ScrapeService>> = match &config.scrape_function_url {
        Some(url) => Some(Arc::new(HttpScrapeAdapter::new(url, config.scrape_api_key.clone())?)),
        None => {
            warn!("SCRAPE_FUNCTION_URL not set; /scrape will be unavailable");
            None
        }
    };

    // --- 4. Seed the Session and Start the Feed ---
    let session = Arc::new(SessionStore::new(persistence, store.clone()));
    if let Some(user_id) = session.current_user_id() {
        info!(%user_id, "Restored session from disk");
        session.refresh_profile().await;
    }
    let feed = MatchFeed::start(
        FeedDeps {
            store: store.clone(),
            transport: Arc::new(hub.clone()),
            session: session.clone(),
        },
        config.feed_options(),
    )
    .await;
    for error in feed.errors() {
        warn!("Initial load: {}", error);
    }

    // --- 5. Build the Shared AppState and Router ---
    let app_state = Arc::new(AppState {
        config: config.clone(),
        feed: feed.clone(),
        session,
        store,
        hub,
        scrape,
    });
    let app = router(app_state);

    // --- 6. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Could not listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    feed.shutdown();
    info!("Sync service stopped");
    Ok(())
}
