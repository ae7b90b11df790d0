use tracing::info;

mod auth;
mod chat;
mod config;
mod connection;
mod entity;
mod error;
mod history;
mod pipeline;
mod protocol;
mod registry;
mod resolver;
mod server;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        // Not fatal, the environment may carry everything already
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Courier starting...");

    let config = config::Config::from_env()?;

    info!("Initializing store at {}", config.db_path.display());
    let store = store::Store::new(&config.db_path).await?;
    store.init().await?;

    let state = server::AppState::new(config.clone(), store.clone());
    let registry = state.registry().clone();
    let app = server::router(state);

    info!("Listening on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                info!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C, shutting down...");
            let closed = registry.close_all();
            info!(closed, "closed live connections");
        })
        .await?;

    store.close().await;
    info!("Courier stopped");
    Ok(())
}
