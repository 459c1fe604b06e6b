use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use aula_server::auth::SessionRegistry;
use aula_server::config::ServerConfig;
use aula_server::store::MemoryStore;
use aula_server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let state = Arc::new(AppState {
        store: Arc::new(MemoryStore::new()),
        sessions: SessionRegistry::new(config.sessions.clone()),
    });

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!("Aula sync server listening on {}", config.bind);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
