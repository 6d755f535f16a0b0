//! Persistent ETag+size cache for Model Sync's conditional downloads.
//! Flushed via temp-file-then-rename under an inter-process advisory lock
//! so concurrent node processes sharing a model directory don't corrupt it.

use std::collections::HashMap;
use std::path::PathBuf;

use fs4::tokio::AsyncFileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
struct CacheFile {
    /// Keyed by "{model}/{file}" -> etag.
    entries: HashMap<String, String>,
}

pub struct EtagCache {
    path: PathBuf,
    state: Mutex<CacheFile>,
}

impl EtagCache {
    pub fn new(path: PathBuf) -> Self {
        let state = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        Self { path, state: Mutex::new(state) }
    }

    fn key(model: &str, file: &str) -> String {
        format!("{}/{}", model, file)
    }

    pub async fn get(&self, model: &str, file: &str) -> Option<String> {
        self.state.lock().await.entries.get(&Self::key(model, file)).cloned()
    }

    pub async fn set(&self, model: &str, file: &str, etag: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.entries.insert(Self::key(model, file), etag.to_string());
        self.flush(&state).await
    }

    async fn flush(&self, state: &CacheFile) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        let serialized = serde_json::to_vec_pretty(state).map_err(|e| Error::Internal(e.to_string()))?;

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await
            .map_err(Error::from)?;

        file.lock_exclusive()
            .await
            .map_err(|e| Error::Internal(format!("etag cache lock failed: {}", e)))?;
        tokio::fs::write(&tmp_path, &serialized).await.map_err(Error::from)?;
        file.unlock()
            .await
            .map_err(|e| Error::Internal(format!("etag cache unlock failed: {}", e)))?;

        tokio::fs::rename(&tmp_path, &self.path).await.map_err(Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let cache = EtagCache::new(tmp.path().join("etags.json"));
        cache.set("example/model", "model.gguf", "\"abc123\"").await.unwrap();
        assert_eq!(cache.get("example/model", "model.gguf").await, Some("\"abc123\"".to_string()));
    }

    #[tokio::test]
    async fn test_get_missing_key_is_none() {
        let tmp = TempDir::new().unwrap();
        let cache = EtagCache::new(tmp.path().join("etags.json"));
        assert!(cache.get("nope", "nope").await.is_none());
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("etags.json");
        {
            let cache = EtagCache::new(path.clone());
            cache.set("m", "f", "etag-1").await.unwrap();
        }
        let reloaded = EtagCache::new(path);
        assert_eq!(reloaded.get("m", "f").await, Some("etag-1".to_string()));
    }
}
