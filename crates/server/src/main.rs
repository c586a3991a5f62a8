//! Stadtchat Server
//!
//! Realtime community chat hub: one global channel plus user-created groups,
//! WebSocket fan-out, presence, and admin moderation.

mod auth;
mod channel;
mod config;
mod error;
mod logging;
mod migration_runner;
mod moderation;
mod registry;
mod store;
mod websocket;

use std::sync::Arc;

use axum::{response::IntoResponse, routing::get, Router};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::AccountRegistry;
use crate::config::ServerConfig;
use crate::registry::ChannelRegistry;
use crate::store::Store;
use crate::websocket::{ws_handler, HubState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    let logging = logging::init_logging()?;
    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        "Starting Stadtchat server"
    );

    let db_path = config.db_path()?;
    {
        let mut conn = rusqlite::Connection::open(&db_path)?;
        migration_runner::run_migrations(&mut conn)?;
    }
    info!(
        component = "server",
        event = "server.db_ready",
        db_path = %db_path.display(),
        "Database migrated and ready"
    );

    let accounts = AccountRegistry::load(config.accounts.as_deref())?;
    let state = Arc::new(HubState {
        registry: ChannelRegistry::new(Store::new(db_path)),
        accounts,
    });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    info!(
        component = "server",
        event = "server.listening",
        addr = %config.listen,
        "Listening"
    );

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}
