//! Configuration types
//!
//! Application and model-pool configuration structures.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory scanned for model files
    pub models_dir: PathBuf,
    /// Model used when a request names none (path, file name or display name)
    pub default_model: Option<String>,
    /// Maximum number of resident models
    pub max_models: usize,
    /// The idle sweep never unloads below this many models
    pub min_resident_models: usize,
    /// Seconds a model may stay unused before the idle sweep unloads it
    pub idle_timeout_secs: u64,
    /// Seconds between idle sweeps
    pub sweep_interval_secs: u64,
    pub cache_enabled: bool,
    /// Optional directory mirroring cache entries as JSON files
    pub cache_dir: Option<PathBuf>,
    pub cache_max_entries: usize,
    pub cache_ttl_secs: u64,
    /// Ceiling on how long a caller waits for a generation response
    pub response_timeout_secs: u64,
    /// Optional directory of extra prompt templates (*.json)
    pub templates_dir: Option<PathBuf>,
    /// Optional directory for the JSON-lines conversation log
    pub conversations_dir: Option<PathBuf>,
    /// Load the default model at startup
    pub preload_default: bool,
    /// Log filter used when RUST_LOG is not set
    pub log_level: String,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Context window size for new engine contexts
    pub context_size: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("./models"),
            default_model: None,
            max_models: 2,
            min_resident_models: 1,
            idle_timeout_secs: 1800,
            sweep_interval_secs: 300,
            cache_enabled: true,
            cache_dir: None,
            cache_max_entries: 1000,
            cache_ttl_secs: 86400,
            response_timeout_secs: 60,
            templates_dir: None,
            conversations_dir: None,
            preload_default: true,
            log_level: "info".to_string(),
            gpu_layers: 0,
            context_size: 4096,
        }
    }
}

impl AppConfig {
    /// Validate configuration values
    ///
    /// Ensures all parameters are within acceptable ranges.
    pub fn validate(&mut self) {
        if self.max_models == 0 {
            self.max_models = 1;
        }
        // At least one model stays warm through idle sweeps
        self.min_resident_models = self.min_resident_models.clamp(1, self.max_models);
        if self.sweep_interval_secs == 0 {
            self.sweep_interval_secs = 300;
        }
        if self.response_timeout_secs == 0 {
            self.response_timeout_secs = 60;
        }
        if self.cache_max_entries == 0 {
            self.cache_max_entries = 1;
        }
        self.context_size = self.context_size.clamp(512, 131072);
        if self.log_level.trim().is_empty() {
            self.log_level = "info".to_string();
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}
