//! Settings storage
//!
//! Loads and persists [`AppConfig`]. Values come from `config.json` in the data directory
//! (or the file named by `CONDUCTOR_CONFIG`), then `CONDUCTOR_*` environment overrides.

use crate::storage::{get_data_dir, StorageError};
use crate::types::AppConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const ENV_PREFIX: &str = "CONDUCTOR_";

/// Get the config file path
fn get_config_path() -> Result<PathBuf, StorageError> {
    if let Ok(path) = std::env::var("CONDUCTOR_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    Ok(get_data_dir()?.join("config.json"))
}

/// Load configuration from disk and the environment
///
/// Returns defaults (plus environment overrides) if the file doesn't exist or is corrupted.
pub fn load_config() -> AppConfig {
    let mut config = match get_config_path().and_then(|path| load_config_from(&path)) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            AppConfig::default()
        }
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate();
    config
}

/// Read a config file; a missing file yields defaults
pub fn load_config_from(path: &Path) -> Result<AppConfig, StorageError> {
    if !path.exists() {
        tracing::info!("Config file not found at {}, using defaults", path.display());
        return Ok(AppConfig::default());
    }

    let json = fs::read_to_string(path)?;
    let mut config: AppConfig = serde_json::from_str(&json)?;
    config.validate();

    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Save configuration to the default location
pub fn save_config(config: &AppConfig) -> Result<(), StorageError> {
    save_config_to(config, &get_config_path()?)
}

pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;

    tracing::debug!("Saved config to {}", path.display());
    Ok(())
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let key = format!("{}{}", ENV_PREFIX, name);
    let raw = lookup(&key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

/// Apply `CONDUCTOR_*` overrides using `lookup` to read variables
pub fn apply_env_overrides(config: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = parse_var::<PathBuf>(&lookup, "MODELS_DIR") {
        config.models_dir = v;
    }
    if let Some(v) = parse_var::<String>(&lookup, "DEFAULT_MODEL") {
        config.default_model = Some(v).filter(|s| !s.is_empty());
    }
    if let Some(v) = parse_var(&lookup, "MAX_MODELS") {
        config.max_models = v;
    }
    if let Some(v) = parse_var(&lookup, "MIN_RESIDENT_MODELS") {
        config.min_resident_models = v;
    }
    if let Some(v) = parse_var(&lookup, "IDLE_TIMEOUT_SECS") {
        config.idle_timeout_secs = v;
    }
    if let Some(v) = parse_var(&lookup, "SWEEP_INTERVAL_SECS") {
        config.sweep_interval_secs = v;
    }
    if let Some(v) = parse_var(&lookup, "CACHE_ENABLED") {
        config.cache_enabled = v;
    }
    if let Some(v) = parse_var::<PathBuf>(&lookup, "CACHE_DIR") {
        config.cache_dir = Some(v);
    }
    if let Some(v) = parse_var(&lookup, "CACHE_MAX_ENTRIES") {
        config.cache_max_entries = v;
    }
    if let Some(v) = parse_var(&lookup, "CACHE_TTL_SECS") {
        config.cache_ttl_secs = v;
    }
    if let Some(v) = parse_var(&lookup, "RESPONSE_TIMEOUT_SECS") {
        config.response_timeout_secs = v;
    }
    if let Some(v) = parse_var::<PathBuf>(&lookup, "TEMPLATES_DIR") {
        config.templates_dir = Some(v);
    }
    if let Some(v) = parse_var::<PathBuf>(&lookup, "CONVERSATIONS_DIR") {
        config.conversations_dir = Some(v);
    }
    if let Some(v) = parse_var(&lookup, "PRELOAD_DEFAULT") {
        config.preload_default = v;
    }
    if let Some(v) = parse_var(&lookup, "LOG_LEVEL") {
        config.log_level = v;
    }
    if let Some(v) = parse_var(&lookup, "GPU_LAYERS") {
        config.gpu_layers = v;
    }
    if let Some(v) = parse_var(&lookup, "CONTEXT_SIZE") {
        config.context_size = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("CONDUCTOR_MAX_MODELS", "4"),
                ("CONDUCTOR_DEFAULT_MODEL", "phi-2.Q4_0.gguf"),
                ("CONDUCTOR_CACHE_ENABLED", "false"),
                ("CONDUCTOR_MODELS_DIR", "/srv/models"),
            ]),
        );
        assert_eq!(config.max_models, 4);
        assert_eq!(config.default_model.as_deref(), Some("phi-2.Q4_0.gguf"));
        assert!(!config.cache_enabled);
        assert_eq!(config.models_dir, PathBuf::from("/srv/models"));
    }

    #[test]
    fn test_invalid_env_value_ignored() {
        let mut config = AppConfig::default();
        apply_env_overrides(&mut config, env(&[("CONDUCTOR_MAX_MODELS", "many")]));
        assert_eq!(config.max_models, 2);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_config_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = AppConfig {
            max_models: 3,
            default_model: Some("llama3-8b.gguf".to_string()),
            ..AppConfig::default()
        };

        save_config_to(&config, &path).unwrap();
        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config_from(&path), Err(StorageError::Json(_))));
    }
}
