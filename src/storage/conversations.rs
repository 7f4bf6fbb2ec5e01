//! Conversation storage
//!
//! Records completed exchanges. The orchestrator only needs the [`ConversationStore`]
//! trait; [`JsonlConversationStore`] appends one JSON line per turn to a file per session.

use crate::storage::StorageError;
use crate::types::Role;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// One persisted message of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub model_id: Option<String>,
    pub tokens: u32,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(
        session_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
        model_id: Option<String>,
        tokens: u32,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            role,
            content: content.into(),
            model_id,
            tokens,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn record(&self, turn: ConversationTurn) -> Result<(), StorageError>;
}

/// Store that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConversationStore;

#[async_trait]
impl ConversationStore for NoopConversationStore {
    async fn record(&self, _turn: ConversationTurn) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Appends turns to `<dir>/<session>.jsonl`
pub struct JsonlConversationStore {
    dir: PathBuf,
}

impl JsonlConversationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.jsonl", safe))
    }

    /// Read back every recorded turn of a session, skipping malformed lines
    pub async fn load_session(&self, session_id: &str) -> Result<Vec<ConversationTurn>, StorageError> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = tokio::fs::read_to_string(&path).await?;
        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(turn) => Some(turn),
                Err(e) => {
                    tracing::warn!("Skipping malformed line in {}: {}", path.display(), e);
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl ConversationStore for JsonlConversationStore {
    async fn record(&self, turn: ConversationTurn) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_string(&turn)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session_path(&turn.session_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
