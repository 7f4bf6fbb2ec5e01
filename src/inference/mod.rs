//! LLM inference
//!
//! Engine abstraction, prompt templates, and the model service that owns resident engines.

pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
pub mod service;
pub mod templates;

pub use engine::{Completion, CompletionRequest, EngineError, EngineLoader, InferenceEngine};
pub use service::{LoadedModel, ModelError, ModelService, ModelStatus, ServiceConfig};
pub use templates::{PromptLibrary, PromptTemplate};
