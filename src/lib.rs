//! conductor
//!
//! Orchestration core for serving local LLMs: a bounded pool of resident models with
//! load deduplication and idle eviction, a response cache, prompt templates, and per-session
//! conversation history, tied together by an in-process event bus.

pub mod app;
pub mod events;
pub mod inference;
pub mod runner;
pub mod storage;
pub mod types;

pub use app::{App, AppError};
pub use events::{Event, EventBus, EventKind, UnloadReason};
pub use types::{AppConfig, GenerationParams, GenerationRequest, GenerationResponse};
