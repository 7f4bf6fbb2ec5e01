//! Model types
//!
//! Defines model metadata and the prompt-format families a model file can belong to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Prompt-format family inferred from a model file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelFormat {
    Mistral,
    MistralInstruct,
    Llama2,
    Llama3,
    Tinyllama,
    Phi,
    Phi2,
    Phi3,
    Phi4,
    Mixtral,
    Uncategorized,
}

impl ModelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFormat::Mistral => "mistral",
            ModelFormat::MistralInstruct => "mistral-instruct",
            ModelFormat::Llama2 => "llama2",
            ModelFormat::Llama3 => "llama3",
            ModelFormat::Tinyllama => "tinyllama",
            ModelFormat::Phi => "phi",
            ModelFormat::Phi2 => "phi2",
            ModelFormat::Phi3 => "phi3",
            ModelFormat::Phi4 => "phi4",
            ModelFormat::Mixtral => "mixtral",
            ModelFormat::Uncategorized => "uncategorized",
        }
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static metadata about a model file on disk
///
/// Descriptors are produced by the registry and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// File basename, used as the model identifier
    pub id: String,
    /// Display name (basename up to the first '.')
    pub name: String,
    /// Path to the model file
    pub path: PathBuf,
    pub format: ModelFormat,
    /// Quantization label such as "Q4_K_M", or "unknown"
    pub quantization: String,
    /// Parameter-size label such as "7B", or "unknown"
    pub parameter_size: String,
    pub context_length: u32,
    /// Model size in bytes
    pub size_bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub supported_features: Vec<String>,
}

impl ModelDescriptor {
    /// Size of the model file in megabytes
    pub fn file_size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }

    /// One-line human readable summary, e.g. "mistral-7b (mistral-instruct, 7B, Q4_K_M)"
    pub fn short_description(&self) -> String {
        format!(
            "{} ({}, {}, {})",
            self.name, self.format, self.parameter_size, self.quantization
        )
    }
}
