//! conductor daemon
//!
//! Loads configuration, starts the orchestration core, and serves until Ctrl-C.

use conductor::app::App;
use conductor::inference::engine::{EngineError, EngineLoader};
use conductor::storage::conversations::{
    ConversationStore, JsonlConversationStore, NoopConversationStore,
};
use conductor::storage::settings::load_config;
use conductor::types::AppConfig;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "llama")]
fn engine_loader(config: &AppConfig) -> Result<Arc<dyn EngineLoader>, EngineError> {
    Ok(Arc::new(conductor::inference::llama::LlamaLoader::new(config)?))
}

#[cfg(not(feature = "llama"))]
fn engine_loader(_config: &AppConfig) -> Result<Arc<dyn EngineLoader>, EngineError> {
    Err(EngineError::Unavailable(
        "built without the `llama` feature; rebuild with --features llama".to_string(),
    ))
}

fn conversation_store(config: &AppConfig) -> Arc<dyn ConversationStore> {
    match &config.conversations_dir {
        Some(dir) => Arc::new(JsonlConversationStore::new(dir)),
        None => Arc::new(NoopConversationStore),
    }
}

#[tokio::main]
async fn main() {
    let config = load_config();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Models directory: {}", config.models_dir.display());

    let loader = match engine_loader(&config) {
        Ok(loader) => loader,
        Err(e) => {
            tracing::error!("Cannot start inference engine: {}", e);
            std::process::exit(1);
        }
    };

    let store = conversation_store(&config);
    let app = App::start(config, loader, store).await;

    for model in app.registry().list_available() {
        tracing::info!(
            "  {} [{:.0} MB] {}",
            model.id,
            model.file_size_mb(),
            model.short_description()
        );
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
    }
    app.shutdown().await;
}
