//! Model Storage: translates between a model name and on-disk paths, and
//! enumerates the descriptors available locally.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use node_protocol::{Capability, ModelDescriptor};
use tokio::fs;

use crate::error::{Error, Result};

const PRIMARY_CANDIDATES: &[&str] = &[
    "model.safetensors.index.json",
    "model.safetensors",
    "model.gguf",
];

pub struct ModelStorage {
    models_dir: PathBuf,
}

impl ModelStorage {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self { models_dir: models_dir.into() }
    }

    /// Stable, total mapping from a model name to its directory.
    /// Lowercases the name and keeps "/" as nested path segments.
    pub fn model_name_to_dir(&self, name: &str) -> PathBuf {
        let normalized = name.to_lowercase();
        let mut dir = self.models_dir.clone();
        for segment in normalized.split('/') {
            dir.push(segment);
        }
        dir
    }

    /// Probe a model's directory for a recognizable primary file and build a
    /// descriptor. Returns `None` if the directory doesn't exist or has no
    /// file Model Storage recognizes.
    pub async fn resolve_descriptor(&self, name: &str) -> Result<Option<ModelDescriptor>> {
        let dir = self.model_name_to_dir(name);
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(None);
        }

        let primary = Self::find_primary_file(&dir).await?;
        let Some(primary) = primary else { return Ok(None) };

        let format = if primary.extension().map_or(false, |e| e == "gguf") {
            "gguf".to_string()
        } else {
            "safetensors".to_string()
        };

        let architecture = Self::read_architecture(&dir).await;
        let size_bytes = Self::directory_size(&dir).await;

        let mut metadata = HashMap::new();
        if primary.file_name().and_then(|f| f.to_str()) == Some("model.safetensors.index.json") {
            let complete = Self::safetensors_shards_complete(&dir, &primary).await;
            metadata.insert("shards_complete".to_string(), complete.to_string());
        }

        Ok(Some(ModelDescriptor {
            name: name.to_lowercase(),
            format,
            architecture,
            capabilities: vec![Capability::Text],
            size_bytes,
            quantization: None,
            modified_at: None,
            model_dir: dir.display().to_string(),
            primary_path: primary.display().to_string(),
            runtime: None,
            metadata,
        }))
    }

    /// A `model.safetensors.index.json`'s `weight_map` names every shard
    /// file the model needs. Returns `false` if any named shard is missing
    /// from `dir`, so an incomplete download never looks loadable.
    async fn safetensors_shards_complete(dir: &Path, index_path: &Path) -> bool {
        let Ok(content) = fs::read_to_string(index_path).await else { return true };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) else { return true };
        let Some(weight_map) = value.get("weight_map").and_then(|w| w.as_object()) else { return true };

        let mut shard_files: HashSet<&str> = HashSet::new();
        for v in weight_map.values() {
            if let Some(s) = v.as_str() {
                shard_files.insert(s);
            }
        }

        for file in &shard_files {
            if !fs::try_exists(dir.join(file)).await.unwrap_or(false) {
                return false;
            }
        }
        true
    }

    async fn find_primary_file(dir: &Path) -> Result<Option<PathBuf>> {
        for candidate in PRIMARY_CANDIDATES {
            let path = dir.join(candidate);
            if fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(Some(path));
            }
        }

        let mut entries = fs::read_dir(dir).await.map_err(Error::from)?;
        while let Some(entry) = entries.next_entry().await.map_err(Error::from)? {
            let path = entry.path();
            if path.extension().map_or(false, |e| e == "gguf" || e == "onnx") {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    async fn read_architecture(dir: &Path) -> Option<String> {
        let config_path = dir.join("config.json");
        let content = fs::read_to_string(&config_path).await.ok()?;
        let value: serde_json::Value = serde_json::from_str(&content).ok()?;
        value
            .get("architectures")
            .and_then(|a| a.as_array())
            .and_then(|arr| arr.first())
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    async fn directory_size(dir: &Path) -> u64 {
        let mut total = 0u64;
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let Ok(mut entries) = fs::read_dir(&current).await else { continue };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(meta) = fs::metadata(&path).await {
                    total += meta.len();
                }
            }
        }
        total
    }

    /// Recursive scan of `models_dir`, skipping directories with no
    /// recognizable primary file.
    pub async fn list_available_descriptors(&self) -> Result<Vec<ModelDescriptor>> {
        let mut descriptors = Vec::new();
        if !fs::try_exists(&self.models_dir).await.unwrap_or(false) {
            return Ok(descriptors);
        }

        let mut stack = vec![(self.models_dir.clone(), String::new())];
        while let Some((dir, prefix)) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(Error::from)?;
            let mut had_subdirs = false;
            while let Some(entry) = entries.next_entry().await.map_err(Error::from)? {
                let path = entry.path();
                if path.is_dir() {
                    had_subdirs = true;
                    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
                    let next_prefix = if prefix.is_empty() {
                        name.to_string()
                    } else {
                        format!("{}/{}", prefix, name)
                    };
                    stack.push((path, next_prefix));
                }
            }

            if !prefix.is_empty() {
                if let Ok(Some(descriptor)) = self.resolve_descriptor(&prefix).await {
                    descriptors.push(descriptor);
                }
            }
            let _ = had_subdirs;
        }

        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(descriptors)
    }

    /// Scans a read-only Ollama model tree (`<mirror_dir>/manifests/...`) for
    /// tags, never touching Model Storage's own directory. Each manifest leaf
    /// file names one pulled tag; its size is the sum of the manifest's
    /// layers plus config blob, mirroring how `ollama list` reports size
    /// without needing to read the blobs themselves.
    pub async fn list_mirrored_tags(mirror_dir: &Path) -> Vec<(String, u64)> {
        let manifests_root = mirror_dir.join("manifests");
        let mut tags = Vec::new();
        let mut stack = vec![(manifests_root, Vec::<String>::new())];

        while let Some((dir, segments)) = stack.pop() {
            let Ok(mut entries) = fs::read_dir(&dir).await else { continue };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|s| s.to_str()) else { continue };
                let mut next_segments = segments.clone();
                next_segments.push(name.to_string());

                if path.is_dir() {
                    stack.push((path, next_segments));
                    continue;
                }

                let tag = Self::manifest_tag_name(&next_segments);
                let size = Self::manifest_total_size(&path).await.unwrap_or(0);
                tags.push((tag, size));
            }
        }

        tags
    }

    /// A manifest path's last two segments are `<model>/<tag>`; everything
    /// before that is the registry/namespace, dropped since `ollama list`
    /// only shows `model:tag`.
    fn manifest_tag_name(segments: &[String]) -> String {
        match segments.len() {
            0 => "unknown".to_string(),
            1 => segments[0].clone(),
            n => format!("{}:{}", segments[n - 2], segments[n - 1]),
        }
    }

    async fn manifest_total_size(path: &Path) -> Option<u64> {
        let content = fs::read_to_string(path).await.ok()?;
        let value: serde_json::Value = serde_json::from_str(&content).ok()?;
        let config_size = value.get("config").and_then(|c| c.get("size")).and_then(|s| s.as_u64()).unwrap_or(0);
        let layers_size = value
            .get("layers")
            .and_then(|l| l.as_array())
            .map(|layers| layers.iter().filter_map(|l| l.get("size").and_then(|s| s.as_u64())).sum())
            .unwrap_or(0);
        Some(config_size + layers_size)
    }

    /// Idempotent delete: returns `Ok(())` whether or not the model existed.
    pub async fn delete_model(&self, name: &str) -> Result<()> {
        let dir = self.model_name_to_dir(name);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!("deleted model directory for {}", name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                tracing::warn!("failed to delete model directory for {}: {}", name, e);
                Err(Error::from(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_model_name_to_dir_is_lowercase_and_nested() {
        let storage = ModelStorage::new("/models");
        let dir = storage.model_name_to_dir("Example/Model-7B");
        assert_eq!(dir, PathBuf::from("/models/example/model-7b"));
    }

    #[tokio::test]
    async fn test_resolve_descriptor_missing_dir_is_none() {
        let tmp = TempDir::new().unwrap();
        let storage = ModelStorage::new(tmp.path());
        let result = storage.resolve_descriptor("nope").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_resolve_descriptor_gguf() {
        let tmp = TempDir::new().unwrap();
        let model_dir = tmp.path().join("example/model");
        tokio::fs::create_dir_all(&model_dir).await.unwrap();
        tokio::fs::write(model_dir.join("model.gguf"), b"fake gguf data").await.unwrap();

        let storage = ModelStorage::new(tmp.path());
        let descriptor = storage.resolve_descriptor("example/model").await.unwrap().unwrap();
        assert_eq!(descriptor.format, "gguf");
        assert_eq!(descriptor.name, "example/model");
        assert!(descriptor.size_bytes > 0);
    }

    #[tokio::test]
    async fn test_resolve_descriptor_reads_architecture_from_config() {
        let tmp = TempDir::new().unwrap();
        let model_dir = tmp.path().join("openai/gpt-oss-20b");
        tokio::fs::create_dir_all(&model_dir).await.unwrap();
        tokio::fs::write(model_dir.join("model.safetensors"), b"fake").await.unwrap();
        tokio::fs::write(
            model_dir.join("config.json"),
            r#"{"architectures": ["GptOssForCausalLM"]}"#,
        )
        .await
        .unwrap();

        let storage = ModelStorage::new(tmp.path());
        let descriptor = storage
            .resolve_descriptor("openai/gpt-oss-20b")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(descriptor.architecture, Some("GptOssForCausalLM".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_descriptor_populates_dir_and_primary_path() {
        let tmp = TempDir::new().unwrap();
        let model_dir = tmp.path().join("example/model");
        tokio::fs::create_dir_all(&model_dir).await.unwrap();
        tokio::fs::write(model_dir.join("model.gguf"), b"fake gguf data").await.unwrap();

        let storage = ModelStorage::new(tmp.path());
        let descriptor = storage.resolve_descriptor("example/model").await.unwrap().unwrap();
        assert_eq!(descriptor.model_dir, model_dir.display().to_string());
        assert_eq!(descriptor.primary_path, model_dir.join("model.gguf").display().to_string());
    }

    #[tokio::test]
    async fn test_resolve_descriptor_flags_incomplete_safetensors_shards() {
        let tmp = TempDir::new().unwrap();
        let model_dir = tmp.path().join("sharded/model");
        tokio::fs::create_dir_all(&model_dir).await.unwrap();
        tokio::fs::write(
            model_dir.join("model.safetensors.index.json"),
            r#"{"weight_map": {"w1": "model-00001-of-00002.safetensors", "w2": "model-00002-of-00002.safetensors"}}"#,
        )
        .await
        .unwrap();
        // only the first shard is actually present on disk
        tokio::fs::write(model_dir.join("model-00001-of-00002.safetensors"), b"x").await.unwrap();

        let storage = ModelStorage::new(tmp.path());
        let descriptor = storage.resolve_descriptor("sharded/model").await.unwrap().unwrap();
        assert_eq!(descriptor.metadata.get("shards_complete"), Some(&"false".to_string()));
    }

    #[tokio::test]
    async fn test_delete_model_idempotent() {
        let tmp = TempDir::new().unwrap();
        let storage = ModelStorage::new(tmp.path());
        assert!(storage.delete_model("never-existed").await.is_ok());

        let model_dir = tmp.path().join("a/b");
        tokio::fs::create_dir_all(&model_dir).await.unwrap();
        tokio::fs::write(model_dir.join("model.gguf"), b"x").await.unwrap();
        assert!(storage.delete_model("a/b").await.is_ok());
        assert!(!model_dir.exists());
        assert!(storage.delete_model("a/b").await.is_ok());
    }

    #[tokio::test]
    async fn test_list_mirrored_tags_reads_manifest_sizes() {
        let tmp = TempDir::new().unwrap();
        let manifest_dir = tmp.path().join("manifests/registry.ollama.ai/library/llama3");
        tokio::fs::create_dir_all(&manifest_dir).await.unwrap();
        tokio::fs::write(
            manifest_dir.join("8b"),
            r#"{"config": {"size": 100}, "layers": [{"size": 900}, {"size": 1000}]}"#,
        )
        .await
        .unwrap();

        let tags = ModelStorage::list_mirrored_tags(tmp.path()).await;
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0], ("llama3:8b".to_string(), 2000));
    }

    #[tokio::test]
    async fn test_list_mirrored_tags_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let tags = ModelStorage::list_mirrored_tags(&tmp.path().join("nonexistent")).await;
        assert!(tags.is_empty());
    }

    #[tokio::test]
    async fn test_list_available_descriptors_skips_dirs_without_primary_file() {
        let tmp = TempDir::new().unwrap();
        let good_dir = tmp.path().join("good/model");
        tokio::fs::create_dir_all(&good_dir).await.unwrap();
        tokio::fs::write(good_dir.join("model.gguf"), b"x").await.unwrap();

        let empty_dir = tmp.path().join("empty/model");
        tokio::fs::create_dir_all(&empty_dir).await.unwrap();

        let storage = ModelStorage::new(tmp.path());
        let descriptors = storage.list_available_descriptors().await.unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "good/model");
    }
}
