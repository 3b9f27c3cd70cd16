use std::sync::Arc;

use anyhow::Context;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tracing::{error, info};

mod config;
mod error;
mod handlers;
mod llm;
mod pipeline;
mod state;
mod storage;
mod style;
#[cfg(test)]
mod testing;
mod utils;

use config::Config;
use llm::GeminiClient;
use state::AppState;
use style::JsonFileStyleStore;
use utils::logging::init_logging;

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {err}");
        return;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Config::load()?;
    let _guards = init_logging(&config.log_level, &config.logs_dir);

    info!(
        "Starting story illustrator v{} (text model {}, image model {})",
        env!("CARGO_PKG_VERSION"),
        config.gemini_model,
        config.imagen_model
    );

    tokio::fs::create_dir_all(&config.images_dir)
        .await
        .with_context(|| format!("creating {}", config.images_dir.display()))?;
    let store = JsonFileStyleStore::open(&config.styles_dir)
        .await
        .context("opening style store")?;
    let gemini = Arc::new(GeminiClient::from_config(&config));

    let bind_address = config.bind_address();
    let state = AppState::new(
        config,
        Arc::new(store),
        gemini.clone(),
        gemini.clone(),
        gemini,
    );
    let app = handlers::router(state);

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {bind_address}"))?;
    info!("Listening on http://{bind_address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}
