//! Shared fixtures for integration tests

#![allow(dead_code)]

use conductor::inference::engine::{
    Completion, CompletionRequest, EngineError, EngineLoader, InferenceEngine,
};
use conductor::types::{AppConfig, ModelDescriptor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Counters shared by a loader and every engine it creates
#[derive(Default)]
pub struct MockStats {
    pub loads: AtomicUsize,
    pub completions: AtomicUsize,
}

impl MockStats {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

pub struct MockEngine {
    model_id: String,
    stats: Arc<MockStats>,
    delay: Duration,
}

impl InferenceEngine for MockEngine {
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, EngineError> {
        self.stats.completions.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let question = request
            .prompt
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.starts_with('['))
            .last()
            .unwrap_or("")
            .to_string();
        Ok(Completion {
            text: format!("{} says: {}</s>ignored", self.model_id, question),
            prompt_tokens: request.prompt.len() as u32 / 4,
            completion_tokens: 7,
        })
    }
}

pub struct MockLoader {
    pub stats: Arc<MockStats>,
    pub load_delay: Duration,
    pub completion_delay: Duration,
}

impl MockLoader {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(MockStats::default()),
            load_delay: Duration::from_millis(5),
            completion_delay: Duration::ZERO,
        }
    }

    pub fn with_completion_delay(mut self, delay: Duration) -> Self {
        self.completion_delay = delay;
        self
    }
}

impl EngineLoader for MockLoader {
    fn load(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn InferenceEngine>, EngineError> {
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.load_delay);
        Ok(Box::new(MockEngine {
            model_id: descriptor.name.clone(),
            stats: self.stats.clone(),
            delay: self.completion_delay,
        }))
    }
}

/// A models directory populated with placeholder weight files
pub fn models_dir(files: &[&str]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for name in files {
        std::fs::write(dir.path().join(name), b"not really weights").unwrap();
    }
    dir
}

pub fn config_for(dir: &TempDir, default_model: Option<&str>) -> AppConfig {
    AppConfig {
        models_dir: dir.path().to_path_buf(),
        default_model: default_model.map(str::to_string),
        ..AppConfig::default()
    }
}
