//! Avatar session server
//!
//! Runs the conversation controller for browser consoles that host a
//! streaming avatar, and logs every conversation to SQLite.

mod api;
mod config;
mod db;
mod relay;
mod runtime;
mod session_log;
mod state_machine;
mod token;
mod transcript;

use api::{create_router, AppState};
use config::AppConfig;
use db::Database;
use std::net::SocketAddr;
use std::sync::Arc;
use token::HttpTokenProvider;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "avatar_session=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = AppConfig::from_env()?;

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    tracing::info!(
        token_url = %config.token_url,
        avatar = %config.console.start_options.avatar_name,
        language = %config.console.start_options.language,
        "Avatar settings loaded"
    );
    let tokens = Arc::new(HttpTokenProvider::new(config.token_url.clone()));
    let state = AppState::new(db, config.console.clone(), tokens);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(compression);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Avatar session server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
