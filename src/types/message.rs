//! Message types
//!
//! Defines conversation turns, roles and the generation request/response payloads.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message from the user
    User,
    /// Message from the AI assistant
    Assistant,
    /// System prompt
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender
    pub role: Role,
    /// The content of the message
    pub content: String,
    /// Timestamp when the message was created
    #[serde(default)]
    pub timestamp: u64,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Request validation errors
#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("Prompt must not be empty")]
    EmptyPrompt,
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

fn default_max_tokens() -> u32 {
    512
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.95
}

fn default_true() -> bool {
    true
}

fn default_max_history() -> usize {
    10
}

/// Per-request generation parameters
///
/// Unknown fields are rejected at deserialization so typos surface at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationParams {
    /// Model to use; the configured default when absent
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    /// Append this exchange to the session history
    #[serde(default = "default_true")]
    pub maintain_history: bool,
    /// Number of exchanges kept per session
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Template override; the loaded model's template when absent
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    /// Stop sequences; replaces the template's stop tokens when present
    #[serde(default)]
    pub stop: Option<Vec<String>>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model_id: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            maintain_history: true,
            max_history: default_max_history(),
            template_id: None,
            use_cache: true,
            stop: None,
        }
    }
}

impl GenerationParams {
    /// Parse parameters from a loose JSON object
    pub fn from_json(value: serde_json::Value) -> Result<Self, RequestError> {
        let mut params: GenerationParams = serde_json::from_value(value)
            .map_err(|e| RequestError::InvalidParameters(e.to_string()))?;
        params.validate();
        Ok(params)
    }

    /// Clamp values into their accepted ranges
    pub fn validate(&mut self) {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        self.max_tokens = self.max_tokens.clamp(1, 65536);
        if self.max_history == 0 {
            self.max_history = 1;
        }
        if let Some(stop) = &mut self.stop {
            stop.retain(|s| !s.is_empty());
        }
    }
}

/// A generation request as it travels on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default = "Uuid::new_v4")]
    pub request_id: Uuid,
    /// Filled in by [`GenerationRequest::validate`] when absent
    #[serde(default)]
    pub session_id: String,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Explicit history; replaces the session history for this request
    #[serde(default)]
    pub history: Option<Vec<Message>>,
    #[serde(default)]
    pub params: GenerationParams,
}

impl GenerationRequest {
    /// Create a request in a fresh session
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            session_id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            system_prompt: None,
            history: None,
            params: GenerationParams::default(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Check the request at the boundary, filling a session id if missing
    pub fn validate(&mut self) -> Result<(), RequestError> {
        if self.session_id.trim().is_empty() {
            self.session_id = Uuid::new_v4().to_string();
        }
        if self.prompt.trim().is_empty() {
            return Err(RequestError::EmptyPrompt);
        }
        self.params.validate();
        Ok(())
    }
}

/// Cost of producing one response
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub tokens_used: u32,
    pub generation_time_ms: u64,
    pub tokens_per_second: f64,
}

impl GenerationMetrics {
    pub fn new(tokens_used: u32, generation_time_ms: u64) -> Self {
        let tokens_per_second = if generation_time_ms > 0 {
            tokens_used as f64 * 1000.0 / generation_time_ms as f64
        } else {
            0.0
        };
        Self {
            tokens_used,
            generation_time_ms,
            tokens_per_second,
        }
    }
}

/// The outcome of a generation request
///
/// Failures use the same shape: text prefixed with "Error: ", zero metrics and model name "error".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub request_id: Uuid,
    pub session_id: String,
    pub text: String,
    pub tokens_used: u32,
    pub generation_time_ms: u64,
    pub model_name: String,
    pub cache_hit: bool,
}

impl GenerationResponse {
    pub fn error(request_id: Uuid, session_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self {
            request_id,
            session_id: session_id.into(),
            text: format!("Error: {}", message),
            tokens_used: 0,
            generation_time_ms: 0,
            model_name: "error".to_string(),
            cache_hit: false,
        }
    }

    pub fn is_error(&self) -> bool {
        self.model_name == "error"
    }
}
