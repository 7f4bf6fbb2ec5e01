//! Persistent storage
//!
//! This module handles model discovery, the response cache, the conversation log, and settings.

pub mod cache;
pub mod conversations;
pub mod models;
pub mod settings;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Could not determine a data directory for this platform")]
    NoDataDir,
}

/// Platform data directory for conductor
///
/// Linux: ~/.local/share/conductor, macOS: ~/Library/Application Support/dev.conductor.conductor
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("dev", "conductor", "conductor")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
