//! ONNX Runtime inference engine: safetensors/onnx model bundles serving
//! text-to-speech via a one-shot CLI synthesis invocation per request, the
//! same externally-managed-process shape as whisper.cpp's transcription.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use node_protocol::{Capability, ModelDescriptor};
use tokio::process::Command;

use super::{Engine, EngineHealth};
use crate::config::ProcessEngineConfig;
use crate::error::{Error, Result};

pub struct OnnxRuntimeEngine {
    config: ProcessEngineConfig,
    bundle_dirs: tokio::sync::RwLock<HashMap<String, PathBuf>>,
    loaded: tokio::sync::RwLock<std::collections::HashSet<String>>,
}

impl OnnxRuntimeEngine {
    pub fn new(config: ProcessEngineConfig) -> Self {
        Self {
            config,
            bundle_dirs: tokio::sync::RwLock::new(HashMap::new()),
            loaded: tokio::sync::RwLock::new(std::collections::HashSet::new()),
        }
    }

    /// A bundle is a directory containing an `onnx` or `safetensors` payload
    /// file plus its tokenizer/config sidecars; the bundle's directory name
    /// is the model id.
    fn discover_bundles(&self) -> HashMap<String, PathBuf> {
        let mut bundles = HashMap::new();
        let model_dir = PathBuf::from(&self.config.model_dir);
        let Ok(entries) = std::fs::read_dir(&model_dir) else { return bundles };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let has_payload = std::fs::read_dir(&path).map_or(false, |mut files| {
                files.any(|f| {
                    f.ok().map_or(false, |f| {
                        let p = f.path();
                        p.extension().map_or(false, |ext| {
                            ext.eq_ignore_ascii_case("onnx") || ext.eq_ignore_ascii_case("safetensors")
                        })
                    })
                })
            });
            if !has_payload {
                continue;
            }
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else { continue };
            bundles.insert(name.to_string(), path);
        }
        bundles
    }

    async fn refresh_bundle_cache(&self) {
        let discovered = self.discover_bundles();
        *self.bundle_dirs.write().await = discovered;
    }

    async fn bundle_dir(&self, model_id: &str) -> Option<PathBuf> {
        self.bundle_dirs.read().await.get(model_id).cloned()
    }

    fn bundle_size(dir: &PathBuf) -> u64 {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| e.metadata().ok())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl Engine for OnnxRuntimeEngine {
    fn engine_type(&self) -> &'static str {
        "onnx_runtime"
    }

    fn formats(&self) -> &[&'static str] {
        &["onnx", "safetensors"]
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::AudioTts]
    }

    async fn health_check(&self) -> Result<EngineHealth> {
        let model_dir = PathBuf::from(&self.config.model_dir);
        if !model_dir.exists() {
            return Err(Error::Unavailable(format!(
                "model directory not found: {}",
                self.config.model_dir
            )));
        }

        let binary_path = PathBuf::from(&self.config.server_binary);
        if binary_path.is_absolute() && !binary_path.exists() {
            return Err(Error::Unavailable(format!(
                "tts-cli binary not found: {}",
                self.config.server_binary
            )));
        }

        Ok(EngineHealth {
            is_healthy: true,
            version: Some("onnxruntime".to_string()),
            models_loaded: self.loaded.read().await.iter().cloned().collect(),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.refresh_bundle_cache().await;
        let bundles = self.bundle_dirs.read().await;
        let mut models = Vec::new();

        for (model_id, dir) in bundles.iter() {
            let has_onnx = std::fs::read_dir(dir).map_or(false, |mut files| {
                files.any(|f| {
                    f.ok()
                        .map_or(false, |f| f.path().extension().map_or(false, |e| e == "onnx"))
                })
            });
            models.push(ModelDescriptor {
                name: model_id.clone(),
                format: if has_onnx { "onnx".to_string() } else { "safetensors".to_string() },
                architecture: None,
                capabilities: vec![Capability::AudioTts],
                size_bytes: Self::bundle_size(dir),
                quantization: None,
                modified_at: None,
                model_dir: dir.display().to_string(),
                primary_path: dir.display().to_string(),
                runtime: Some(self.engine_type().to_string()),
                metadata: HashMap::new(),
            });
        }

        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    async fn load_model(&self, descriptor: &ModelDescriptor) -> Result<()> {
        self.refresh_bundle_cache().await;
        let dir = if descriptor.model_dir.is_empty() {
            self.bundle_dir(&descriptor.name)
                .await
                .ok_or_else(|| Error::NotFound(format!("model not found: {}", descriptor.name)))?
        } else {
            PathBuf::from(&descriptor.model_dir)
        };

        if !dir.exists() {
            return Err(Error::NotFound(format!("bundle directory not found: {}", dir.display())));
        }

        self.loaded.write().await.insert(descriptor.name.clone());
        tracing::info!("model {} registered for on-demand onnxruntime synthesis", descriptor.name);
        Ok(())
    }

    async fn unload_model(&self, model_id: &str) -> Result<()> {
        self.loaded.write().await.remove(model_id);
        Ok(())
    }

    async fn memory_usage_gb(&self, model_id: &str) -> Option<f32> {
        if !self.loaded.read().await.contains(model_id) {
            return None;
        }
        let dir = self.bundle_dir(model_id).await?;
        Some(Self::bundle_size(&dir) as f32 / (1024.0 * 1024.0 * 1024.0) * 1.1)
    }

    async fn synthesize_speech(&self, model_id: &str, text: &str) -> Result<Vec<u8>> {
        if !self.loaded.read().await.contains(model_id) {
            return Err(Error::Unavailable(format!("{} is not loaded", model_id)));
        }
        let dir = self
            .bundle_dir(model_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("model not found: {}", model_id)))?;

        let tmp_dir = std::env::temp_dir();
        let output_path = tmp_dir.join(format!("llm-node-tts-{}.wav", uuid::Uuid::new_v4()));

        let output = Command::new(&self.config.server_binary)
            .arg("--model-dir")
            .arg(&dir)
            .arg("--text")
            .arg(text)
            .arg("--output")
            .arg(&output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Unavailable(format!("failed to run tts-cli for {}: {}", model_id, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = tokio::fs::remove_file(&output_path).await;
            return Err(Error::Internal(format!("tts-cli exited with {}: {}", output.status, stderr)));
        }

        let audio = tokio::fs::read(&output_path).await.map_err(Error::from)?;
        let _ = tokio::fs::remove_file(&output_path).await;
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProcessEngineConfig {
        ProcessEngineConfig {
            enabled: true,
            model_dir: "/tmp/llm-node-test-onnx-models".to_string(),
            server_binary: "/usr/bin/tts-cli".to_string(),
            gpu_layers: None,
            context_size: None,
            base_port: None,
            max_servers: 1,
            model_memory_gb: HashMap::new(),
            startup_timeout_secs: 30,
            shutdown_timeout_secs: 5,
            log_server_output: false,
            extra_args: vec![],
        }
    }

    #[test]
    fn test_engine_type_and_capabilities() {
        let engine = OnnxRuntimeEngine::new(test_config());
        assert_eq!(engine.engine_type(), "onnx_runtime");
        assert_eq!(engine.capabilities(), &[Capability::AudioTts]);
    }

    #[tokio::test]
    async fn test_list_models_discovers_bundle_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let bundle_dir = tmp.path().join("piper-voice");
        std::fs::create_dir_all(&bundle_dir).unwrap();
        std::fs::write(bundle_dir.join("model.onnx"), b"x").unwrap();

        let mut config = test_config();
        config.model_dir = tmp.path().display().to_string();
        let engine = OnnxRuntimeEngine::new(config);

        let models = engine.list_models().await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "piper-voice");
        assert_eq!(models[0].format, "onnx");
    }

    #[tokio::test]
    async fn test_load_model_missing_bundle_not_found() {
        let engine = OnnxRuntimeEngine::new(test_config());
        let descriptor = ModelDescriptor {
            name: "nonexistent".to_string(),
            format: "onnx".to_string(),
            architecture: None,
            capabilities: vec![Capability::AudioTts],
            size_bytes: 0,
            quantization: None,
            modified_at: None,
            model_dir: String::new(),
            primary_path: String::new(),
            runtime: None,
            metadata: HashMap::new(),
        };
        assert!(matches!(engine.load_model(&descriptor).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_synthesize_speech_requires_loaded_model() {
        let engine = OnnxRuntimeEngine::new(test_config());
        let result = engine.synthesize_speech("never-loaded", "hello").await;
        assert!(matches!(result, Err(Error::Unavailable(_))));
    }
}
