//! Agent gateway: routes and streams bidirectional conversations between
//! long-lived agent processes and heterogeneous frontends.

mod api;
mod arbiter;
mod config;
mod connection;
mod conversation;
mod db;
mod dedup;
mod error;
mod ledger;
mod model;
mod resolver;
mod wire;

use api::{create_router, AppState};
use config::GatewayConfig;
use db::Database;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_gateway=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = GatewayConfig::from_env();

    let parent = PathBuf::from(&config.db_path).parent().map(PathBuf::from);
    if let Some(parent) = parent.filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path, "opening database");
    let db = Database::open(&config.db_path)?;

    let bind_addr: SocketAddr = config.bind_addr.parse()?;
    let state = AppState::new(db, config);
    let app = create_router(state);

    tracing::info!(%bind_addr, "agent gateway listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
