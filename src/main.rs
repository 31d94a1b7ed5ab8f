//! chatflow server - hosts flow sessions behind a JSON session API

use chatflow::action::ActionExecutor;
use chatflow::api::{create_router, AppState};
use chatflow::catalog::FlowCatalog;
use chatflow::config::ServerConfig;
use chatflow::http::ReqwestTransport;
use chatflow::options::{OptionCache, OptionLoader};
use chatflow::registry::Registry;
use chatflow::runtime::{RuntimeConfig, SessionManager};
use chatflow::storage::SqliteStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatflow=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = ServerConfig::from_env();

    // Ensure storage directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %config.db_path.display(), "Opening durable storage");
    let durable = Arc::new(SqliteStore::open(&config.db_path)?);

    let client = reqwest::Client::builder().timeout(config.http_timeout).build()?;
    let transport = Arc::new(ReqwestTransport::with_client(client));
    let registry = Arc::new(Registry::standard(transport.clone()));

    let catalog = FlowCatalog::load_dir(&config.flows_dir, &registry)?;
    tracing::info!(dir = %config.flows_dir.display(), flows = catalog.len(), "Flow catalog loaded");

    let loader = Arc::new(OptionLoader::new(registry.clone(), transport, Arc::new(OptionCache::new())));
    let sessions = Arc::new(SessionManager::new(
        Arc::new(ActionExecutor::new(registry.clone())),
        durable,
        RuntimeConfig {
            auto_advance_delay: config.auto_advance_delay,
            completed_retention: config.completed_retention,
        },
    ));

    let state = AppState::new(sessions, Arc::new(catalog), registry, loader);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state).layer(cors).layer(compression);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("chatflow server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
