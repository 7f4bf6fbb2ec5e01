//! Application root
//!
//! Builds every component from an [`AppConfig`], wires the bus listeners, and tears it all
//! down again on [`App::shutdown`]. Nothing here is global; callers hold the `App`.

use crate::events::{BusError, Event, EventBus, EventKind, UnloadReason};
use crate::inference::engine::EngineLoader;
use crate::inference::service::{ModelError, ModelService, ServiceConfig};
use crate::inference::templates::PromptLibrary;
use crate::runner::LlmRunner;
use crate::storage::cache::ResponseCache;
use crate::storage::conversations::ConversationStore;
use crate::storage::models::ModelRegistry;
use crate::types::{AppConfig, GenerationRequest, GenerationResponse, ModelDescriptor, RequestError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

pub struct App {
    config: AppConfig,
    bus: EventBus,
    registry: Arc<ModelRegistry>,
    templates: Arc<PromptLibrary>,
    cache: Arc<ResponseCache>,
    models: Arc<ModelService>,
    runner: Arc<LlmRunner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    /// Build and start all components
    ///
    /// Listeners subscribe before they are spawned, so no event published after this returns
    /// is missed. A failed default-model preload is logged, not fatal.
    pub async fn start(
        config: AppConfig,
        loader: Arc<dyn EngineLoader>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        let bus = EventBus::new();

        let registry = Arc::new(ModelRegistry::new(&config.models_dir));
        registry.scan();
        registry.set_default_model(config.default_model.clone());

        let templates = Arc::new(PromptLibrary::new());
        if let Some(dir) = &config.templates_dir {
            if let Err(e) = templates.load_dir(dir) {
                tracing::warn!("Failed to load templates from {}: {}", dir.display(), e);
            }
        }

        let mut cache = ResponseCache::new(config.cache_max_entries, config.cache_ttl());
        if let Some(dir) = &config.cache_dir {
            cache = cache.with_dir(dir);
        }
        if !config.cache_enabled {
            cache.disable();
        }
        let cache = Arc::new(cache);

        let models = Arc::new(ModelService::new(
            registry.clone(),
            templates.clone(),
            loader,
            bus.clone(),
            ServiceConfig::from(&config),
        ));
        let runner = Arc::new(LlmRunner::new(
            models.clone(),
            templates.clone(),
            cache.clone(),
            store,
            bus.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            runner.spawn_request_listener(
                bus.subscribe(EventKind::GenerationRequested),
                shutdown_rx.clone(),
            ),
            runner.spawn_session_listener(
                bus.subscribe(EventKind::SessionCleared),
                shutdown_rx.clone(),
            ),
            models.spawn_load_listener(
                bus.subscribe(EventKind::ModelLoadRequested),
                shutdown_rx.clone(),
            ),
            models.spawn_maintenance(shutdown_rx),
        ];

        if config.preload_default {
            if let Some(id) = registry.default_model_id() {
                match models.get_model(&id, true).await {
                    Ok(model) => tracing::info!("Preloaded default model {}", model.id()),
                    Err(e) => tracing::warn!("Could not preload default model {}: {}", id, e),
                }
            }
        }

        tracing::info!(
            "Started with {} model(s) available, pool size {}",
            registry.list_available().len(),
            config.max_models
        );

        Self {
            config,
            bus,
            registry,
            templates,
            cache,
            models,
            runner,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn templates(&self) -> &Arc<PromptLibrary> {
        &self.templates
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn models(&self) -> &Arc<ModelService> {
        &self.models
    }

    pub fn runner(&self) -> &Arc<LlmRunner> {
        &self.runner
    }

    /// Submit a request over the bus and wait for its response
    ///
    /// The wait is capped by `response_timeout_secs`; a timeout is reported even if the
    /// generation later completes.
    pub async fn generate(&self, mut request: GenerationRequest) -> Result<GenerationResponse, AppError> {
        request.validate()?;
        let request_id = request.request_id;
        let pending = self.bus.expect(EventKind::GenerationCompleted, move |event| {
            matches!(event, Event::GenerationCompleted(r) if r.request_id == request_id)
        });
        self.bus.publish(Event::GenerationRequested(request));

        match pending.wait(self.config.response_timeout()).await {
            Ok(Event::GenerationCompleted(response)) => Ok(response),
            Ok(_) => Err(AppError::Bus(BusError::Closed)),
            Err(BusError::Timeout(after)) => {
                tracing::warn!("Request {} timed out after {:?}", request_id, after);
                Err(AppError::Timeout(after))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Make a model resident, returning its descriptor
    pub async fn load_model(&self, id: &str, priority: bool) -> Result<Arc<ModelDescriptor>, AppError> {
        let model = self.models.get_model(id, priority).await?;
        Ok(model.descriptor().clone())
    }

    pub fn unload_model(&self, id: &str) -> bool {
        self.models.unload_model(id, UnloadReason::Manual)
    }

    pub fn clear_session(&self, session_id: &str) {
        self.bus.publish(Event::SessionCleared {
            session_id: session_id.to_string(),
        });
    }

    /// Stop the listeners and sweep, then release every model
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down");
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        self.models.shutdown();
    }
}
