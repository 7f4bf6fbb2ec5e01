//! Event types
//!
//! The closed set of events carried by the bus and their payloads.

use crate::types::{GenerationRequest, GenerationResponse, ModelDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel selector; one channel exists per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    GenerationRequested,
    GenerationCompleted,
    SessionCleared,
    ModelLoadRequested,
    ModelLoaded,
    ModelUnloaded,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::GenerationRequested,
        EventKind::GenerationCompleted,
        EventKind::SessionCleared,
        EventKind::ModelLoadRequested,
        EventKind::ModelLoaded,
        EventKind::ModelUnloaded,
    ];
}

/// Why a model left the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnloadReason {
    Manual,
    Lru,
    Idle,
    Shutdown,
    Error,
}

impl fmt::Display for UnloadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnloadReason::Manual => "manual",
            UnloadReason::Lru => "lru",
            UnloadReason::Idle => "idle",
            UnloadReason::Shutdown => "shutdown",
            UnloadReason::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    GenerationRequested(GenerationRequest),
    GenerationCompleted(GenerationResponse),
    SessionCleared {
        session_id: String,
    },
    ModelLoadRequested {
        model_id: String,
        priority: bool,
    },
    ModelLoaded {
        model_id: String,
        success: bool,
        error: Option<String>,
        descriptor: Option<ModelDescriptor>,
    },
    ModelUnloaded {
        model_id: String,
        reason: UnloadReason,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::GenerationRequested(_) => EventKind::GenerationRequested,
            Event::GenerationCompleted(_) => EventKind::GenerationCompleted,
            Event::SessionCleared { .. } => EventKind::SessionCleared,
            Event::ModelLoadRequested { .. } => EventKind::ModelLoadRequested,
            Event::ModelLoaded { .. } => EventKind::ModelLoaded,
            Event::ModelUnloaded { .. } => EventKind::ModelUnloaded,
        }
    }
}
