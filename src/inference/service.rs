//! Model service
//!
//! Owns the bounded pool of resident models. A model identifier moves
//! Unloaded -> Loading -> Loaded -> Unloaded; while Loading, every other caller for the same
//! model waits on the one in-flight attempt instead of starting its own. The pool never holds
//! more than `max_models` loaded engines: the least recently used model is evicted to make
//! room, sparing the default model unless the request is priority or nothing else is left.
//! A background sweep unloads models idle for longer than `idle_timeout`.
//!
//! The pool lock is a plain mutex and is never held across an `.await`.

use crate::events::{Event, EventBus, EventKind, Subscription, UnloadReason};
use crate::inference::engine::{Completion, CompletionRequest, EngineError, EngineLoader, InferenceEngine};
use crate::inference::templates::{PromptLibrary, PromptTemplate};
use crate::storage::models::{Lookup, ModelRegistry};
use crate::types::{AppConfig, ModelDescriptor};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("Model not found: {0}")]
    NotFound(String),
    #[error("Not a model file: {0}")]
    Unrecognized(String),
    #[error("Failed to load model {id}: {reason}")]
    LoadFailed { id: String, reason: String },
    #[error("Model service is shutting down")]
    ShuttingDown,
}

/// Pool sizing and sweep settings
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub max_models: usize,
    pub min_resident: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ServiceConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_models: config.max_models.max(1),
            min_resident: config.min_resident_models.max(1),
            idle_timeout: config.idle_timeout(),
            sweep_interval: config.sweep_interval(),
        }
    }
}

/// A resident engine bound to its descriptor and prompt template
pub struct LoadedModel {
    descriptor: Arc<ModelDescriptor>,
    template: Arc<PromptTemplate>,
    engine: Box<dyn InferenceEngine>,
}

impl LoadedModel {
    pub fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Template chosen from the model's format
    pub fn template(&self) -> &Arc<PromptTemplate> {
        &self.template
    }

    /// Blocking completion; call from a blocking worker
    pub fn complete(&self, request: &CompletionRequest) -> Result<Completion, EngineError> {
        self.engine.complete(request)
    }
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("id", &self.descriptor.id)
            .field("template", &self.template.name)
            .finish()
    }
}

/// Observable state of one model identifier
#[derive(Debug, Clone, PartialEq)]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Loaded { idle_for: Duration },
}

type LoadOutcome = Option<Result<Arc<LoadedModel>, ModelError>>;

struct Resident {
    model: Arc<LoadedModel>,
    last_used: Instant,
}

enum Slot {
    Loading(watch::Receiver<LoadOutcome>),
    Loaded(Resident),
}

impl Slot {
    /// A Loading slot whose loader went away without reporting
    fn is_abandoned(&self) -> bool {
        match self {
            Slot::Loading(rx) => rx.has_changed().is_err() && rx.borrow().is_none(),
            Slot::Loaded(_) => false,
        }
    }
}

enum Claim {
    Ready(Arc<LoadedModel>),
    Wait(watch::Receiver<LoadOutcome>),
    Load(watch::Sender<LoadOutcome>),
}

/// Clears a Loading slot if the loading future is dropped before it finishes
struct LoadingGuard<'a> {
    slots: &'a Mutex<HashMap<String, Slot>>,
    key: &'a str,
    armed: bool,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(slots.get(self.key), Some(Slot::Loading(_))) {
            slots.remove(self.key);
            tracing::warn!("Load of {} was abandoned", self.key);
        }
    }
}

pub struct ModelService {
    registry: Arc<ModelRegistry>,
    templates: Arc<PromptLibrary>,
    loader: Arc<dyn EngineLoader>,
    bus: EventBus,
    config: ServiceConfig,
    slots: Mutex<HashMap<String, Slot>>,
    shutting_down: AtomicBool,
}

impl ModelService {
    pub fn new(
        registry: Arc<ModelRegistry>,
        templates: Arc<PromptLibrary>,
        loader: Arc<dyn EngineLoader>,
        bus: EventBus,
        config: ServiceConfig,
    ) -> Self {
        Self {
            registry,
            templates,
            loader,
            bus,
            config,
            slots: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map a requested identifier to a descriptor
    ///
    /// Tries the path, then file or display name. Only the configured default may fall back
    /// to another model, and only when it cannot be found on disk.
    pub fn resolve(&self, id: &str) -> Result<Arc<ModelDescriptor>, ModelError> {
        let is_default = self.registry.default_model_id().as_deref() == Some(id);

        let found = match self.registry.lookup(id) {
            Lookup::Found(d) => Some(d),
            Lookup::Unrecognized(path) => {
                return Err(ModelError::Unrecognized(path.display().to_string()))
            }
            Lookup::NotFound => self.registry.find_by_name(id),
        };

        match found {
            Some(d) if d.path.is_file() => Ok(d),
            _ if is_default => {
                let fallback = self
                    .registry
                    .list_available()
                    .into_iter()
                    .find(|d| d.path.is_file())
                    .ok_or_else(|| ModelError::NotFound(id.to_string()))?;
                tracing::warn!(
                    "Default model {} not available, falling back to {}",
                    id,
                    fallback.id
                );
                Ok(fallback)
            }
            _ => Err(ModelError::NotFound(id.to_string())),
        }
    }

    /// Pool key of the default model, if one is configured and resolvable
    fn default_key(&self) -> Option<String> {
        let id = self.registry.default_model_id()?;
        self.resolve(&id).ok().map(|d| d.id.clone())
    }

    /// Return a resident handle for `id`, loading it if needed
    pub async fn get_model(&self, id: &str, priority: bool) -> Result<Arc<LoadedModel>, ModelError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ModelError::ShuttingDown);
        }
        let descriptor = self.resolve(id)?;
        let key = descriptor.id.clone();

        loop {
            let claim = {
                let mut slots = self.lock();
                if slots.get(&key).is_some_and(Slot::is_abandoned) {
                    slots.remove(&key);
                }
                match slots.get_mut(&key) {
                    Some(Slot::Loaded(resident)) => {
                        resident.last_used = Instant::now();
                        Claim::Ready(resident.model.clone())
                    }
                    Some(Slot::Loading(rx)) => Claim::Wait(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        slots.insert(key.clone(), Slot::Loading(rx));
                        Claim::Load(tx)
                    }
                }
            };

            match claim {
                Claim::Ready(model) => return Ok(model),
                Claim::Load(tx) => return self.load(descriptor, priority, tx).await,
                Claim::Wait(mut rx) => {
                    tracing::debug!("Waiting for in-flight load of {}", key);
                    let outcome = rx.wait_for(Option::is_some).await.map(|o| o.clone());
                    if let Ok(Some(result)) = outcome {
                        return result;
                    }
                    // The loader vanished; try again.
                }
            }
        }
    }

    async fn load(
        &self,
        descriptor: Arc<ModelDescriptor>,
        priority: bool,
        tx: watch::Sender<LoadOutcome>,
    ) -> Result<Arc<LoadedModel>, ModelError> {
        let key = descriptor.id.clone();
        let mut guard = LoadingGuard {
            slots: &self.slots,
            key: &key,
            armed: true,
        };

        self.make_space_for_model(priority, &key);

        tracing::info!("Loading model {} from {}", key, descriptor.path.display());
        let loader = self.loader.clone();
        let d = descriptor.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.load(&d))
            .await
            .unwrap_or_else(|e| Err(EngineError::Load(format!("load task failed: {}", e))));

        let result = match loaded {
            Ok(engine) => {
                let model = Arc::new(LoadedModel {
                    template: self.templates.template_for_format(descriptor.format),
                    descriptor: descriptor.clone(),
                    engine,
                });
                let default_key = self.default_key();
                let evicted = {
                    let mut slots = self.lock();
                    let mut evicted = Vec::new();
                    while loaded_count(&slots, &key) >= self.config.max_models {
                        match pick_victim(&slots, default_key.as_deref(), priority, &key) {
                            Some(victim) => {
                                slots.remove(&victim);
                                evicted.push(victim);
                            }
                            None => break,
                        }
                    }
                    slots.insert(
                        key.clone(),
                        Slot::Loaded(Resident {
                            model: model.clone(),
                            last_used: Instant::now(),
                        }),
                    );
                    evicted
                };
                for victim in evicted {
                    self.announce_unload(&victim, UnloadReason::Lru);
                }
                tracing::info!("Model {} loaded ({} resident)", key, self.loaded_count());
                Ok(model)
            }
            Err(e) => {
                self.lock().remove(&key);
                tracing::error!("Failed to load model {}: {}", key, e);
                let error = ModelError::LoadFailed {
                    id: key.clone(),
                    reason: e.to_string(),
                };
                self.bus.publish(Event::ModelLoaded {
                    model_id: key.clone(),
                    success: false,
                    error: Some(error.to_string()),
                    descriptor: Some((*descriptor).clone()),
                });
                Err(error)
            }
        };

        guard.armed = false;
        tx.send_replace(Some(result.clone()));
        result
    }

    /// Evict the least recently used model if the pool is full
    ///
    /// Only resident models count toward capacity; loads still in flight are settled when they
    /// commit. The default model is spared unless `priority` is set or it is the only
    /// candidate. Returns the evicted identifier.
    pub fn make_space_for_model(&self, priority: bool, incoming: &str) -> Option<String> {
        let default_key = self.default_key();
        let victim = {
            let mut slots = self.lock();
            if loaded_count(&slots, incoming) < self.config.max_models {
                return None;
            }
            let victim = pick_victim(&slots, default_key.as_deref(), priority, incoming)?;
            slots.remove(&victim);
            victim
        };
        self.announce_unload(&victim, UnloadReason::Lru);
        Some(victim)
    }

    /// Unload models idle past the timeout, oldest first, keeping `min_resident` loaded
    ///
    /// The floor is never below one model.
    pub fn check_unused_models(&self) -> Vec<String> {
        let now = Instant::now();
        let idle = {
            let mut slots = self.lock();
            let mut loaded: Vec<(String, Instant)> = slots
                .iter()
                .filter_map(|(k, slot)| match slot {
                    Slot::Loaded(r) => Some((k.clone(), r.last_used)),
                    Slot::Loading(_) => None,
                })
                .collect();
            loaded.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

            let mut remaining = loaded.len();
            let mut idle = Vec::new();
            for (key, last_used) in loaded {
                if remaining <= self.config.min_resident.max(1) {
                    break;
                }
                if now.duration_since(last_used) > self.config.idle_timeout {
                    slots.remove(&key);
                    remaining -= 1;
                    idle.push(key);
                }
            }
            idle
        };
        for key in &idle {
            self.announce_unload(key, UnloadReason::Idle);
        }
        idle
    }

    fn key_for(&self, id: &str) -> Option<String> {
        if self.lock().contains_key(id) {
            return Some(id.to_string());
        }
        self.resolve(id).ok().map(|d| d.id.clone())
    }

    /// Release a loaded model; does nothing if it is not loaded
    pub fn unload_model(&self, id: &str, reason: UnloadReason) -> bool {
        let Some(key) = self.key_for(id) else {
            return false;
        };
        let removed = {
            let mut slots = self.lock();
            match slots.get(&key) {
                Some(Slot::Loaded(_)) => slots.remove(&key).is_some(),
                _ => false,
            }
        };
        if removed {
            self.announce_unload(&key, reason);
        }
        removed
    }

    fn announce_unload(&self, key: &str, reason: UnloadReason) {
        tracing::info!("Unloaded model {} ({})", key, reason);
        self.bus.publish(Event::ModelUnloaded {
            model_id: key.to_string(),
            reason,
        });
    }

    pub fn status(&self, id: &str) -> ModelStatus {
        let Some(key) = self.key_for(id) else {
            return ModelStatus::Unloaded;
        };
        match self.lock().get(&key) {
            Some(Slot::Loaded(r)) => ModelStatus::Loaded {
                idle_for: Instant::now().duration_since(r.last_used),
            },
            Some(Slot::Loading(_)) => ModelStatus::Loading,
            None => ModelStatus::Unloaded,
        }
    }

    /// Descriptors of resident models, ordered by identifier
    pub fn loaded_models(&self) -> Vec<Arc<ModelDescriptor>> {
        let mut models: Vec<_> = self
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Loaded(r) => Some(r.model.descriptor.clone()),
                Slot::Loading(_) => None,
            })
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub fn loaded_count(&self) -> usize {
        loaded_count(&self.lock(), "")
    }

    /// Refuse new loads and release every resident model
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let drained: Vec<String> = {
            let mut slots = self.lock();
            let keys: Vec<String> = slots
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Loaded(_)))
                .map(|(k, _)| k.clone())
                .collect();
            for key in &keys {
                slots.remove(key);
            }
            keys
        };
        for key in &drained {
            self.announce_unload(key, UnloadReason::Shutdown);
        }
        tracing::info!("Model service shut down ({} model(s) released)", drained.len());
    }

    /// Run the idle sweep every `sweep_interval` until `shutdown` fires
    pub fn spawn_maintenance(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.sweep_interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let unloaded = service.check_unused_models();
                        if !unloaded.is_empty() {
                            tracing::info!("Idle sweep unloaded {} model(s)", unloaded.len());
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Idle sweep stopped");
        })
    }

    /// Answer every model-load request on the bus with a model-loaded event
    pub fn spawn_load_listener(
        self: &Arc<Self>,
        mut requests: Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        debug_assert_eq!(requests.kind(), EventKind::ModelLoadRequested);
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = requests.recv() => match event {
                        Some(Event::ModelLoadRequested { model_id, priority }) => {
                            let service = service.clone();
                            tokio::spawn(async move {
                                service.handle_load_request(model_id, priority).await;
                            });
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Model load listener stopped");
        })
    }

    async fn handle_load_request(&self, model_id: String, priority: bool) {
        let event = match self.get_model(&model_id, priority).await {
            Ok(model) => Event::ModelLoaded {
                model_id,
                success: true,
                error: None,
                descriptor: Some((**model.descriptor()).clone()),
            },
            Err(e) => Event::ModelLoaded {
                model_id,
                success: false,
                error: Some(e.to_string()),
                descriptor: None,
            },
        };
        self.bus.publish(event);
    }
}

fn loaded_count(slots: &HashMap<String, Slot>, exclude: &str) -> usize {
    slots
        .iter()
        .filter(|(k, slot)| k.as_str() != exclude && matches!(slot, Slot::Loaded(_)))
        .count()
}

/// Oldest loaded model other than `exclude`, sparing the default when possible
fn pick_victim(
    slots: &HashMap<String, Slot>,
    default_key: Option<&str>,
    priority: bool,
    exclude: &str,
) -> Option<String> {
    let mut candidates: Vec<(&String, Instant)> = slots
        .iter()
        .filter_map(|(k, slot)| match slot {
            Slot::Loaded(r) if k.as_str() != exclude => Some((k, r.last_used)),
            _ => None,
        })
        .collect();
    candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

    if priority || candidates.len() == 1 {
        return candidates.first().map(|(k, _)| (*k).clone());
    }
    candidates
        .iter()
        .find(|(k, _)| Some(k.as_str()) != default_key)
        .map(|(k, _)| (*k).clone())
}
