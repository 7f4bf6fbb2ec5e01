//! Engine abstraction
//!
//! The native text-generation backend sits behind two small blocking traits: an
//! [`EngineLoader`] turns a model file into an [`InferenceEngine`], and the engine turns a
//! formatted prompt into text. Both are only ever called from a blocking worker thread.

use crate::types::ModelDescriptor;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Generation failed: {0}")]
    Generation(String),
    #[error("Engine unavailable: {0}")]
    Unavailable(String),
}

/// A fully formatted prompt plus sampling settings
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Generation halts when any of these appears in the output
    pub stop: Vec<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Completion {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

pub trait InferenceEngine: Send + Sync {
    /// Run one blocking completion
    fn complete(&self, request: &CompletionRequest) -> Result<Completion, EngineError>;
}

pub trait EngineLoader: Send + Sync {
    /// Instantiate an engine for `descriptor`; may take seconds and allocate gigabytes
    fn load(&self, descriptor: &ModelDescriptor) -> Result<Box<dyn InferenceEngine>, EngineError>;
}

/// Cut `text` at the earliest stop sequence, returning whether one was found
pub fn truncate_at_stop(text: &str, stop: &[String]) -> (String, bool) {
    let cut = stop
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min();
    match cut {
        Some(idx) => (text[..idx].to_string(), true),
        None => (text.to_string(), false),
    }
}
