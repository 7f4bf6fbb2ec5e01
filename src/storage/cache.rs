//! Response cache
//!
//! Content-addressed store of finished generations keyed by a SHA-256 fingerprint of the
//! prompt and its parameters. Entries expire after a TTL; when the store grows past its
//! capacity the single oldest entry is evicted. An optional directory mirrors entries as
//! `<fingerprint>.json` files so they survive restarts.
//!
//! The mirror does blocking file I/O inside `get`, `put` and `clear`. Async callers should
//! run those on a blocking worker when [`ResponseCache::is_mirrored`] is true.

use crate::types::GenerationMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub text: String,
    pub metrics: GenerationMetrics,
    pub created_at: DateTime<Utc>,
}

/// Fingerprint a prompt and its parameters
///
/// Parameters are serialized through `serde_json::Value`, whose object keys are sorted, so
/// field order never changes the fingerprint.
pub fn fingerprint<P: Serialize + ?Sized>(prompt: &str, params: &P) -> Option<String> {
    let canonical = match serde_json::to_value(params) {
        Ok(value) => value.to_string(),
        Err(e) => {
            tracing::warn!("Parameters are not cacheable: {}", e);
            return None;
        }
    };
    let mut hasher = Sha256::new();
    hasher.update(prompt.trim().as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}

pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    enabled: AtomicBool,
    max_entries: usize,
    ttl: Duration,
    cache_dir: Option<PathBuf>,
}

impl ResponseCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            enabled: AtomicBool::new(true),
            max_entries: max_entries.max(1),
            ttl,
            cache_dir: None,
        }
    }

    /// Mirror entries to `dir` (created on first write)
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        tracing::info!("Response cache enabled");
    }

    /// Stop serving and storing entries; existing entries are kept
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        tracing::info!("Response cache disabled");
    }

    /// Whether entries are mirrored to disk
    pub fn is_mirrored(&self) -> bool {
        self.cache_dir.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(entry.created_at);
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => age < ttl,
            Err(_) => true,
        }
    }

    fn entry_path(&self, key: &str) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", key)))
    }

    pub fn get<P: Serialize + ?Sized>(
        &self,
        prompt: &str,
        params: &P,
    ) -> Option<(String, GenerationMetrics)> {
        self.get_at(prompt, params, Utc::now())
    }

    pub fn put<P: Serialize + ?Sized>(
        &self,
        prompt: &str,
        params: &P,
        text: &str,
        metrics: GenerationMetrics,
    ) {
        self.put_at(prompt, params, text, metrics, Utc::now())
    }

    /// Look up an entry as of `now`
    pub fn get_at<P: Serialize + ?Sized>(
        &self,
        prompt: &str,
        params: &P,
        now: DateTime<Utc>,
    ) -> Option<(String, GenerationMetrics)> {
        if !self.is_enabled() {
            return None;
        }
        let key = fingerprint(prompt, params)?;

        {
            let mut entries = self.lock();
            if let Some(entry) = entries.get(&key) {
                if self.is_fresh(entry, now) {
                    tracing::debug!("Cache hit for {}", &key[..12]);
                    return Some((entry.text.clone(), entry.metrics.clone()));
                }
                entries.remove(&key);
                self.remove_file(&key);
                return None;
            }
        }

        let entry = self.read_file(&key)?;
        if !self.is_fresh(&entry, now) {
            self.remove_file(&key);
            return None;
        }
        tracing::debug!("Cache hit on disk for {}", &key[..12]);
        let result = (entry.text.clone(), entry.metrics.clone());
        self.insert(key, entry);
        Some(result)
    }

    /// Store an entry stamped with `now`
    pub fn put_at<P: Serialize + ?Sized>(
        &self,
        prompt: &str,
        params: &P,
        text: &str,
        metrics: GenerationMetrics,
        now: DateTime<Utc>,
    ) {
        if !self.is_enabled() {
            return;
        }
        let Some(key) = fingerprint(prompt, params) else {
            return;
        };
        let entry = CacheEntry {
            text: text.to_string(),
            metrics,
            created_at: now,
        };
        self.write_file(&key, &entry);
        self.insert(key, entry);
    }

    fn insert(&self, key: String, entry: CacheEntry) {
        let evicted = {
            let mut entries = self.lock();
            entries.insert(key, entry);
            if entries.len() > self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.created_at)
                    .map(|(k, _)| k.clone());
                if let Some(k) = &oldest {
                    entries.remove(k);
                }
                oldest
            } else {
                None
            }
        };
        if let Some(key) = evicted {
            tracing::debug!("Evicted oldest cache entry {}", &key[..12]);
            self.remove_file(&key);
        }
    }

    /// Drop every entry, including mirrored files
    pub fn clear(&self) {
        self.lock().clear();
        if let Some(dir) = &self.cache_dir {
            if let Err(e) = clear_dir(dir) {
                tracing::warn!("Failed to clear cache directory {}: {}", dir.display(), e);
            }
        }
        tracing::info!("Response cache cleared");
    }

    fn read_file(&self, key: &str) -> Option<CacheEntry> {
        let path = self.entry_path(key)?;
        let json = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&json) {
            Ok(entry) => Some(entry),
            Err(_) => {
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    fn write_file(&self, key: &str, entry: &CacheEntry) {
        let Some(path) = self.entry_path(key) else {
            return;
        };
        let result = path
            .parent()
            .map(fs::create_dir_all)
            .transpose()
            .and_then(|_| serde_json::to_string(entry).map_err(std::io::Error::other))
            .and_then(|json| fs::write(&path, json));
        if let Err(e) = result {
            tracing::warn!("Failed to write cache entry {}: {}", path.display(), e);
        }
    }

    fn remove_file(&self, key: &str) {
        if let Some(path) = self.entry_path(key) {
            let _ = fs::remove_file(path);
        }
    }
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metrics() -> GenerationMetrics {
        GenerationMetrics::new(12, 300)
    }

    #[test]
    fn test_put_then_get() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        let params = json!({ "temperature": 0.7, "max_tokens": 512 });

        assert!(cache.get("hello", &params).is_none());
        cache.put("hello", &params, "world", metrics());

        let (text, m) = cache.get("hello", &params).unwrap();
        assert_eq!(text, "world");
        assert_eq!(m.tokens_used, 12);
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        let a: serde_json::Value =
            serde_json::from_str(r#"{"temperature":0.7,"max_tokens":512}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"max_tokens":512,"temperature":0.7}"#).unwrap();

        cache.put("prompt", &a, "answer", metrics());
        assert_eq!(cache.get("prompt", &b).unwrap().0, "answer");
        assert_eq!(fingerprint("prompt", &a), fingerprint("prompt", &b));
        assert_ne!(fingerprint("prompt", &a), fingerprint("other", &a));
    }

    #[test]
    fn test_ttl_boundary() {
        let cache = ResponseCache::new(10, Duration::from_secs(100));
        let params = json!({});
        let t = Utc::now();
        cache.put_at("p", &params, "r", metrics(), t);

        let eps = chrono::Duration::milliseconds(1);
        let ttl = chrono::Duration::seconds(100);
        assert!(cache.get_at("p", &params, t + ttl - eps).is_some());
        assert!(cache.get_at("p", &params, t + ttl + eps).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicts_single_oldest() {
        let cache = ResponseCache::new(2, Duration::from_secs(3600));
        let params = json!({});
        let t = Utc::now();
        cache.put_at("a", &params, "1", metrics(), t);
        cache.put_at("b", &params, "2", metrics(), t + chrono::Duration::seconds(1));
        cache.put_at("c", &params, "3", metrics(), t + chrono::Duration::seconds(2));

        assert_eq!(cache.len(), 2);
        let now = t + chrono::Duration::seconds(3);
        assert!(cache.get_at("a", &params, now).is_none());
        assert!(cache.get_at("b", &params, now).is_some());
        assert!(cache.get_at("c", &params, now).is_some());
    }

    #[test]
    fn test_disable_keeps_entries() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        let params = json!({});
        cache.put("p", &params, "r", metrics());

        cache.disable();
        assert!(cache.get("p", &params).is_none());
        cache.put("q", &params, "s", metrics());
        assert_eq!(cache.len(), 1);

        cache.enable();
        assert!(cache.get("p", &params).is_some());

        cache.clear();
        assert!(cache.get("p", &params).is_none());
    }

    #[test]
    fn test_disk_mirror_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let params = json!({ "model_id": "phi-2" });

        let cache = ResponseCache::new(10, Duration::from_secs(60)).with_dir(dir.path());
        cache.put("p", &params, "persisted", metrics());

        let reopened = ResponseCache::new(10, Duration::from_secs(60)).with_dir(dir.path());
        assert_eq!(reopened.get("p", &params).unwrap().0, "persisted");
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let params = json!({});
        let key = fingerprint("p", &params).unwrap();
        let path = dir.path().join(format!("{}.json", key));
        fs::write(&path, "{ broken").unwrap();

        let cache = ResponseCache::new(10, Duration::from_secs(60)).with_dir(dir.path());
        assert!(cache.get("p", &params).is_none());
        assert!(!path.exists());
    }
}
