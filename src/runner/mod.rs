//! Request orchestration
//!
//! The [`LlmRunner`] turns a generation request into a response: it picks the model, builds
//! the prompt from the session history and template, consults the response cache, runs the
//! engine on a blocking worker, and records the exchange. Failures never escape as errors;
//! they become error-shaped responses.
//!
//! Requests for the same session are handled one at a time. The session lock is held from
//! history read to history write so concurrent turns cannot interleave.

pub mod session;

pub use session::{trim_history, Session};

use crate::events::{Event, EventBus, EventKind, Subscription};
use crate::inference::engine::{CompletionRequest, EngineError};
use crate::inference::service::{ModelError, ModelService};
use crate::inference::templates::PromptLibrary;
use crate::storage::cache::ResponseCache;
use crate::storage::conversations::{ConversationStore, ConversationTurn};
use crate::types::{
    GenerationMetrics, GenerationRequest, GenerationResponse, Message, RequestError, Role,
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("No model specified and no default model configured")]
    NoModel,
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Everything besides the prompt that changes the output
#[derive(Debug, Clone, Serialize)]
struct CacheParams {
    model_id: String,
    template: String,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    stop: Vec<String>,
}

pub struct LlmRunner {
    models: Arc<ModelService>,
    templates: Arc<PromptLibrary>,
    cache: Arc<ResponseCache>,
    store: Arc<dyn ConversationStore>,
    bus: EventBus,
    sessions: DashMap<String, Arc<Mutex<Session>>>,
}

impl LlmRunner {
    pub fn new(
        models: Arc<ModelService>,
        templates: Arc<PromptLibrary>,
        cache: Arc<ResponseCache>,
        store: Arc<dyn ConversationStore>,
        bus: EventBus,
    ) -> Self {
        Self {
            models,
            templates,
            cache,
            store,
            bus,
            sessions: DashMap::new(),
        }
    }

    fn session(&self, session_id: &str) -> Arc<Mutex<Session>> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(session_id))))
            .clone()
    }

    /// Snapshot of a session's history
    pub async fn session_history(&self, session_id: &str) -> Option<Vec<Message>> {
        let session = self.sessions.get(session_id).map(|s| s.clone())?;
        let session = session.lock().await;
        Some(session.messages().to_vec())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Forget a session's history
    pub fn clear_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            tracing::info!("Cleared session {}", session_id);
        }
        removed
    }

    /// Handle one request; errors become error-shaped responses
    pub async fn process_request(&self, mut request: GenerationRequest) -> GenerationResponse {
        let request_id = request.request_id;
        let validated = request.validate();
        let session_id = request.session_id.clone();

        let result = match validated {
            Ok(()) => self.try_process(request).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Request {} failed: {}", request_id, e);
                self.discard_if_empty(&session_id);
                GenerationResponse::error(request_id, session_id, e)
            }
        }
    }

    /// Cache lookup; a disk-mirrored cache is read on a blocking worker
    async fn cache_lookup(
        &self,
        prompt: &str,
        params: &CacheParams,
    ) -> Option<(String, GenerationMetrics)> {
        if !self.cache.is_mirrored() {
            return self.cache.get(prompt, params);
        }
        let cache = self.cache.clone();
        let (prompt, params) = (prompt.to_string(), params.clone());
        tokio::task::spawn_blocking(move || cache.get(&prompt, &params))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Cache lookup task failed: {}", e);
                None
            })
    }

    async fn cache_store(
        &self,
        prompt: &str,
        params: &CacheParams,
        text: &str,
        metrics: GenerationMetrics,
    ) {
        if !self.cache.is_mirrored() {
            self.cache.put(prompt, params, text, metrics);
            return;
        }
        let cache = self.cache.clone();
        let (prompt, params, text) = (prompt.to_string(), params.clone(), text.to_string());
        if let Err(e) =
            tokio::task::spawn_blocking(move || cache.put(&prompt, &params, &text, metrics)).await
        {
            tracing::warn!("Cache store task failed: {}", e);
        }
    }

    /// Drop a session a failed request left without history
    fn discard_if_empty(&self, session_id: &str) {
        let removed = self.sessions.remove_if(session_id, |_, session| {
            session
                .try_lock()
                .map(|s| s.messages().is_empty())
                .unwrap_or(false)
        });
        if removed.is_some() {
            tracing::debug!("Discarded empty session {}", session_id);
        }
    }

    /// Runs a request that has already passed [`GenerationRequest::validate`]
    async fn try_process(&self, request: GenerationRequest) -> Result<GenerationResponse, RunnerError> {
        let params = &request.params;

        let model_id = params
            .model_id
            .clone()
            .or_else(|| self.models.registry().default_model_id())
            .ok_or(RunnerError::NoModel)?;

        let model = self.models.get_model(&model_id, false).await?;

        let session = self.session(&request.session_id);
        let mut session = session.lock().await;
        let template = match &params.template_id {
            Some(name) => self.templates.get_template(name),
            None => model.template().clone(),
        };

        let history: Vec<Message> = match &request.history {
            Some(history) => history.clone(),
            None if params.maintain_history => session.messages().to_vec(),
            None => Vec::new(),
        };
        let prompt = template.format_prompt(
            &request.prompt,
            request.system_prompt.as_deref(),
            &history,
        );
        tracing::debug!("Prompt for request {}: {:?}", request.request_id, prompt);

        let stop = template.stop_tokens_for(params.stop.as_deref());
        let cache_params = CacheParams {
            model_id: model.id().to_string(),
            template: template.name.clone(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stop: stop.clone(),
        };

        let started = Instant::now();
        let cached = if params.use_cache {
            self.cache_lookup(&prompt, &cache_params).await
        } else {
            None
        };
        let cache_hit = cached.is_some();

        let (text, tokens_used) = match cached {
            Some((text, metrics)) => (text, metrics.tokens_used),
            None => {
                let completion_request = CompletionRequest {
                    prompt: prompt.clone(),
                    stop: stop.clone(),
                    max_tokens: params.max_tokens,
                    temperature: params.temperature,
                    top_p: params.top_p,
                };
                let engine = model.clone();
                let completion =
                    tokio::task::spawn_blocking(move || engine.complete(&completion_request))
                        .await
                        .unwrap_or_else(|e| {
                            Err(EngineError::Generation(format!("generation task failed: {}", e)))
                        })?;

                let text = template.extract_response(&completion.text);
                let elapsed = started.elapsed().as_millis() as u64;
                if params.use_cache {
                    let metrics = GenerationMetrics::new(completion.completion_tokens, elapsed);
                    self.cache_store(&prompt, &cache_params, &text, metrics).await;
                }
                (text, completion.completion_tokens)
            }
        };
        let generation_time_ms = started.elapsed().as_millis() as u64;

        if params.maintain_history {
            session.push_exchange(
                Message::user(request.prompt.clone()),
                Message::assistant(text.clone()),
                params.max_history,
            );
        }
        drop(session);

        self.record_exchange(&request, model.id(), &text, tokens_used);

        tracing::info!(
            "Request {} answered by {} ({} tokens, {} ms{})",
            request.request_id,
            model.id(),
            tokens_used,
            generation_time_ms,
            if cache_hit { ", cached" } else { "" }
        );

        Ok(GenerationResponse {
            request_id: request.request_id,
            session_id: request.session_id,
            text,
            tokens_used,
            generation_time_ms,
            model_name: model.id().to_string(),
            cache_hit,
        })
    }

    /// Hand the exchange to the conversation store without waiting on it
    fn record_exchange(&self, request: &GenerationRequest, model_id: &str, text: &str, tokens: u32) {
        let turns = [
            ConversationTurn::new(
                request.session_id.clone(),
                Role::User,
                request.prompt.clone(),
                Some(model_id.to_string()),
                0,
            ),
            ConversationTurn::new(
                request.session_id.clone(),
                Role::Assistant,
                text,
                Some(model_id.to_string()),
                tokens,
            ),
        ];
        let store = self.store.clone();
        tokio::spawn(async move {
            for turn in turns {
                if let Err(e) = store.record(turn).await {
                    tracing::warn!("Failed to record conversation turn: {}", e);
                }
            }
        });
    }

    /// Answer every generation request on the bus with a completion event
    pub fn spawn_request_listener(
        self: &Arc<Self>,
        mut requests: Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        debug_assert_eq!(requests.kind(), EventKind::GenerationRequested);
        let runner = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = requests.recv() => match event {
                        Some(Event::GenerationRequested(request)) => {
                            let runner = runner.clone();
                            tokio::spawn(async move {
                                let response = runner.process_request(request).await;
                                runner.bus.publish(Event::GenerationCompleted(response));
                            });
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Generation request listener stopped");
        })
    }

    /// Drop session history when a session-clear event arrives
    pub fn spawn_session_listener(
        self: &Arc<Self>,
        mut clears: Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        debug_assert_eq!(clears.kind(), EventKind::SessionCleared);
        let runner = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = clears.recv() => match event {
                        Some(Event::SessionCleared { session_id }) => {
                            runner.clear_session(&session_id);
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("Session listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::engine::{Completion, EngineLoader, InferenceEngine};
    use crate::inference::service::ServiceConfig;
    use crate::storage::models::ModelRegistry;
    use crate::storage::StorageError;
    use crate::types::{GenerationParams, ModelDescriptor};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Script {
        reply: StdMutex<String>,
        fail: AtomicBool,
        calls: AtomicUsize,
        requests: StdMutex<Vec<CompletionRequest>>,
    }

    struct ScriptedEngine(Arc<Script>);

    impl InferenceEngine for ScriptedEngine {
        fn complete(&self, request: &CompletionRequest) -> Result<Completion, EngineError> {
            self.0.calls.fetch_add(1, Ordering::SeqCst);
            self.0.requests.lock().unwrap().push(request.clone());
            if self.0.fail.load(Ordering::SeqCst) {
                return Err(EngineError::Generation("out of memory".to_string()));
            }
            Ok(Completion {
                text: self.0.reply.lock().unwrap().clone(),
                prompt_tokens: 10,
                completion_tokens: 4,
            })
        }
    }

    struct ScriptedLoader(Arc<Script>);

    impl EngineLoader for ScriptedLoader {
        fn load(&self, _d: &ModelDescriptor) -> Result<Box<dyn InferenceEngine>, EngineError> {
            Ok(Box::new(ScriptedEngine(self.0.clone())))
        }
    }

    #[derive(Default)]
    struct MemoryStore(StdMutex<Vec<ConversationTurn>>);

    #[async_trait]
    impl ConversationStore for MemoryStore {
        async fn record(&self, turn: ConversationTurn) -> Result<(), StorageError> {
            self.0.lock().unwrap().push(turn);
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        script: Arc<Script>,
        store: Arc<MemoryStore>,
        runner: Arc<LlmRunner>,
        bus: EventBus,
    }

    fn fixture() -> Fixture {
        fixture_with_cache(ResponseCache::new(100, Duration::from_secs(3600)))
    }

    fn fixture_with_cache(cache: ResponseCache) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mistral-7b-instruct.Q4_K_M.gguf"), b"w").unwrap();
        let registry = Arc::new(ModelRegistry::new(dir.path()));
        registry.scan();
        registry.set_default_model(Some("mistral-7b-instruct".to_string()));

        let script = Arc::new(Script::default());
        *script.reply.lock().unwrap() = "Paris</s>trailing".to_string();
        let templates = Arc::new(PromptLibrary::new());
        let bus = EventBus::new();
        let models = Arc::new(ModelService::new(
            registry,
            templates.clone(),
            Arc::new(ScriptedLoader(script.clone())),
            bus.clone(),
            ServiceConfig::default(),
        ));
        let store = Arc::new(MemoryStore::default());
        let runner = Arc::new(LlmRunner::new(
            models,
            templates,
            Arc::new(cache),
            store.clone(),
            bus.clone(),
        ));
        Fixture {
            _dir: dir,
            script,
            store,
            runner,
            bus,
        }
    }

    #[tokio::test]
    async fn test_generation_and_history() {
        let f = fixture();
        let response = f
            .runner
            .process_request(GenerationRequest::new("Capital of France?").with_session("s1"))
            .await;

        assert_eq!(response.text, "Paris");
        assert_eq!(response.tokens_used, 4);
        assert_eq!(response.model_name, "mistral-7b-instruct.Q4_K_M.gguf");
        assert!(!response.cache_hit);

        let history = f.runner.session_history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].content, "Paris");

        // Second turn sees the first in its prompt
        f.runner
            .process_request(GenerationRequest::new("And Spain?").with_session("s1"))
            .await;
        let requests = f.script.requests.lock().unwrap();
        assert!(requests[1].prompt.contains("Capital of France?"));
        assert_eq!(requests[1].stop, vec!["</s>".to_string()]);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_engine_and_updates_history() {
        let f = fixture();
        let first = f
            .runner
            .process_request(GenerationRequest::new("hi").with_session("a"))
            .await;
        let second = f
            .runner
            .process_request(GenerationRequest::new("hi").with_session("b"))
            .await;

        assert_eq!(f.script.calls.load(Ordering::SeqCst), 1);
        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(second.text, first.text);
        assert_eq!(second.tokens_used, first.tokens_used);
        assert_eq!(f.runner.session_history("b").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mirrored_cache_serves_a_fresh_runner() {
        let cache_dir = tempfile::tempdir().unwrap();
        let mirrored =
            || ResponseCache::new(100, Duration::from_secs(3600)).with_dir(cache_dir.path());

        let first = fixture_with_cache(mirrored());
        let response = first
            .runner
            .process_request(GenerationRequest::new("hi").with_session("a"))
            .await;
        assert!(!response.cache_hit);
        assert_eq!(first.script.calls.load(Ordering::SeqCst), 1);

        let second = fixture_with_cache(mirrored());
        let response = second
            .runner
            .process_request(GenerationRequest::new("hi").with_session("a"))
            .await;
        assert!(response.cache_hit);
        assert_eq!(response.text, "Paris");
        assert_eq!(second.script.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_use_cache_false_always_generates() {
        let f = fixture();
        let params = GenerationParams {
            use_cache: false,
            ..GenerationParams::default()
        };
        for _ in 0..2 {
            let r = f
                .runner
                .process_request(GenerationRequest::new("hi").with_params(params.clone()))
                .await;
            assert!(!r.cache_hit);
        }
        assert_eq!(f.script.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_model_yields_error_response() {
        let f = fixture();
        let params = GenerationParams {
            model_id: Some("nope.gguf".to_string()),
            ..GenerationParams::default()
        };
        let response = f
            .runner
            .process_request(GenerationRequest::new("hi").with_params(params))
            .await;

        assert!(response.is_error());
        assert_eq!(response.text, "Error: Model not found: nope.gguf");
        assert_eq!(response.tokens_used, 0);
        assert_eq!(response.generation_time_ms, 0);
    }

    #[tokio::test]
    async fn test_generation_failure_leaves_session_unchanged() {
        let f = fixture();
        f.runner
            .process_request(GenerationRequest::new("first").with_session("s"))
            .await;
        f.script.fail.store(true, Ordering::SeqCst);

        let response = f
            .runner
            .process_request(GenerationRequest::new("second").with_session("s"))
            .await;

        assert!(response.text.starts_with("Error: Generation failed"));
        assert_eq!(f.runner.session_history("s").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_request_gets_session_id_and_leaves_no_session() {
        let f = fixture();
        let params = GenerationParams {
            model_id: Some("nope.gguf".to_string()),
            ..GenerationParams::default()
        };
        let request = GenerationRequest::new("hi").with_session("").with_params(params);
        let response = f.runner.process_request(request).await;

        assert!(response.is_error());
        assert!(!response.session_id.is_empty());
        assert_eq!(f.runner.session_count(), 0);

        let response = f
            .runner
            .process_request(GenerationRequest::new("  ").with_session(""))
            .await;
        assert_eq!(response.text, "Error: Prompt must not be empty");
        assert!(!response.session_id.is_empty());
        assert_eq!(f.runner.session_count(), 0);
    }

    #[tokio::test]
    async fn test_generation_failure_in_new_session_is_discarded() {
        let f = fixture();
        f.script.fail.store(true, Ordering::SeqCst);

        let response = f
            .runner
            .process_request(GenerationRequest::new("hello").with_session("fresh"))
            .await;

        assert!(response.is_error());
        assert_eq!(response.session_id, "fresh");
        assert!(f.runner.session_history("fresh").await.is_none());
        assert_eq!(f.runner.session_count(), 0);
    }

    #[tokio::test]
    async fn test_explicit_history_stop_and_template_override() {
        let f = fixture();
        let params = GenerationParams {
            maintain_history: false,
            template_id: Some("llama3".to_string()),
            stop: Some(vec!["###".to_string()]),
            ..GenerationParams::default()
        };
        let mut request = GenerationRequest::new("next").with_session("x").with_params(params);
        request.history = Some(vec![Message::user("earlier"), Message::assistant("reply")]);

        f.runner.process_request(request).await;

        let requests = f.script.requests.lock().unwrap();
        assert!(requests[0].prompt.contains("<|start_header_id|>user<|end_header_id|>\n\nearlier"));
        assert_eq!(requests[0].stop, vec!["###".to_string()]);
        drop(requests);
        assert!(f.runner.session_history("x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exchange_is_recorded() {
        let f = fixture();
        f.runner
            .process_request(GenerationRequest::new("hi").with_session("rec"))
            .await;

        for _ in 0..50 {
            if f.store.0.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let turns = f.store.0.lock().unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].content, "Paris");
        assert_eq!(turns[1].tokens, 4);
    }

    #[tokio::test]
    async fn test_listeners_over_the_bus() {
        let f = fixture();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let requests = f.runner.spawn_request_listener(
            f.bus.subscribe(EventKind::GenerationRequested),
            shutdown_rx.clone(),
        );
        let clears = f
            .runner
            .spawn_session_listener(f.bus.subscribe(EventKind::SessionCleared), shutdown_rx);

        let request = GenerationRequest::new("hi").with_session("bus");
        let request_id = request.request_id;
        let pending = f.bus.expect(EventKind::GenerationCompleted, move |e| {
            matches!(e, Event::GenerationCompleted(r) if r.request_id == request_id)
        });
        f.bus.publish(Event::GenerationRequested(request));

        match pending.wait(Duration::from_secs(5)).await.unwrap() {
            Event::GenerationCompleted(response) => assert_eq!(response.text, "Paris"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(f.runner.session_count(), 1);

        f.bus.publish(Event::SessionCleared {
            session_id: "bus".to_string(),
        });
        for _ in 0..50 {
            if f.runner.session_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.runner.session_count(), 0);

        shutdown_tx.send(true).unwrap();
        requests.await.unwrap();
        clears.await.unwrap();
    }
}
