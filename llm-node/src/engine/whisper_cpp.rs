//! whisper.cpp inference engine: GGUF/bin audio transcription via a
//! one-shot CLI invocation per request. Unlike llama.cpp and gpt-oss,
//! whisper.cpp's CLI transcribes a single file and exits, so there's no
//! long-lived server process to pool; "loading" a model here just means
//! validating the model file exists and is addressable by path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use node_protocol::{Capability, ModelDescriptor};
use tokio::process::Command;

use super::{Engine, EngineHealth};
use crate::config::ProcessEngineConfig;
use crate::error::{Error, Result};

pub struct WhisperCppEngine {
    config: ProcessEngineConfig,
    model_paths: tokio::sync::RwLock<HashMap<String, PathBuf>>,
    loaded: tokio::sync::RwLock<std::collections::HashSet<String>>,
}

impl WhisperCppEngine {
    pub fn new(config: ProcessEngineConfig) -> Self {
        Self {
            config,
            model_paths: tokio::sync::RwLock::new(HashMap::new()),
            loaded: tokio::sync::RwLock::new(std::collections::HashSet::new()),
        }
    }

    fn discover_models(&self) -> HashMap<String, PathBuf> {
        let mut models = HashMap::new();
        let model_dir = PathBuf::from(&self.config.model_dir);
        if !model_dir.exists() {
            return models;
        }
        Self::scan_directory(&model_dir, &mut models);
        models
    }

    fn scan_directory(dir: &PathBuf, models: &mut HashMap<String, PathBuf>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                Self::scan_directory(&path, models);
                continue;
            }
            let is_model_file = path
                .extension()
                .map_or(false, |ext| ext.eq_ignore_ascii_case("gguf") || ext.eq_ignore_ascii_case("bin"));
            if !is_model_file {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            models.insert(stem.to_string(), path);
        }
    }

    async fn refresh_model_cache(&self) {
        let discovered = self.discover_models();
        *self.model_paths.write().await = discovered;
    }

    async fn model_path(&self, model_id: &str) -> Option<PathBuf> {
        self.model_paths.read().await.get(model_id).cloned()
    }
}

#[async_trait]
impl Engine for WhisperCppEngine {
    fn engine_type(&self) -> &'static str {
        "whisper_cpp"
    }

    fn formats(&self) -> &[&'static str] {
        &["gguf", "bin"]
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::AudioAsr]
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
                "whisper-cli binary not found: {}",
                self.config.server_binary
            )));
        }

        Ok(EngineHealth {
            is_healthy: true,
            version: Some("whisper.cpp".to_string()),
            models_loaded: self.loaded.read().await.iter().cloned().collect(),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.refresh_model_cache().await;
        let paths = self.model_paths.read().await;
        let mut models = Vec::new();

        for (model_id, path) in paths.iter() {
            let format = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
                .unwrap_or_else(|| "gguf".to_string());
            let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

            models.push(ModelDescriptor {
                name: model_id.clone(),
                format,
                architecture: None,
                capabilities: vec![Capability::AudioAsr],
                size_bytes,
                quantization: None,
                modified_at: None,
                model_dir: path.parent().map(|p| p.display().to_string()).unwrap_or_default(),
                primary_path: path.display().to_string(),
                runtime: Some(self.engine_type().to_string()),
                metadata: HashMap::new(),
            });
        }

        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    async fn load_model(&self, descriptor: &ModelDescriptor) -> Result<()> {
        self.refresh_model_cache().await;
        let model_path = if descriptor.primary_path.is_empty() {
            self.model_path(&descriptor.name)
                .await
                .ok_or_else(|| Error::NotFound(format!("model not found: {}", descriptor.name)))?
        } else {
            PathBuf::from(&descriptor.primary_path)
        };

        if !model_path.exists() {
            return Err(Error::NotFound(format!("model file not found: {}", model_path.display())));
        }

        self.loaded.write().await.insert(descriptor.name.clone());
        tracing::info!("model {} registered for on-demand whisper.cpp transcription", descriptor.name);
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
        let path = self.model_path(model_id).await?;
        let bytes = std::fs::metadata(&path).ok()?.len();
        Some(bytes as f32 / (1024.0 * 1024.0 * 1024.0) * 1.1)
    }

    async fn transcribe(&self, model_id: &str, audio: &[u8]) -> Result<String> {
        if !self.loaded.read().await.contains(model_id) {
            return Err(Error::Unavailable(format!("{} is not loaded", model_id)));
        }
        let model_path = self
            .model_path(model_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("model not found: {}", model_id)))?;

        let tmp_dir = std::env::temp_dir();
        let input_path = tmp_dir.join(format!("llm-node-whisper-{}.wav", uuid::Uuid::new_v4()));
        tokio::fs::write(&input_path, audio).await.map_err(Error::from)?;

        let mut cmd = Command::new(&self.config.server_binary);
        cmd.arg("-m")
            .arg(&model_path)
            .arg("-f")
            .arg(&input_path)
            .arg("--no-timestamps")
            .arg("--output-txt")
            .arg("--output-file")
            .arg(input_path.with_extension(""))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| {
            Error::Unavailable(format!("failed to run whisper-cli for {}: {}", model_id, e))
        });

        let _ = tokio::fs::remove_file(&input_path).await;
        let txt_path = input_path.with_extension("txt");

        let output = output?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = tokio::fs::remove_file(&txt_path).await;
            return Err(Error::Internal(format!("whisper-cli exited with {}: {}", output.status, stderr)));
        }

        let text = match tokio::fs::read_to_string(&txt_path).await {
            Ok(text) => text,
            Err(_) => String::from_utf8_lossy(&output.stdout).to_string(),
        };
        let _ = tokio::fs::remove_file(&txt_path).await;

        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProcessEngineConfig {
        ProcessEngineConfig {
            enabled: true,
            model_dir: "/tmp/llm-node-test-whisper-models".to_string(),
            server_binary: "/usr/bin/whisper-cli".to_string(),
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
    fn test_engine_type_and_formats() {
        let engine = WhisperCppEngine::new(test_config());
        assert_eq!(engine.engine_type(), "whisper_cpp");
        assert_eq!(engine.formats(), &["gguf", "bin"]);
        assert_eq!(engine.capabilities(), &[Capability::AudioAsr]);
    }

    #[tokio::test]
    async fn test_list_models_discovers_bin_and_gguf() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("ggml-base.en.bin"), b"x").unwrap();
        std::fs::write(tmp.path().join("ggml-large-v3.gguf"), b"xx").unwrap();
        let mut config = test_config();
        config.model_dir = tmp.path().display().to_string();
        let engine = WhisperCppEngine::new(config);

        let models = engine.list_models().await.unwrap();
        assert_eq!(models.len(), 2);
    }

    #[tokio::test]
    async fn test_load_model_file_not_found() {
        let engine = WhisperCppEngine::new(test_config());
        let descriptor = ModelDescriptor {
            name: "nonexistent-model".to_string(),
            format: "bin".to_string(),
            architecture: None,
            capabilities: vec![Capability::AudioAsr],
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
    async fn test_transcribe_requires_loaded_model() {
        let engine = WhisperCppEngine::new(test_config());
        let result = engine.transcribe("never-loaded", b"").await;
        assert!(matches!(result, Err(Error::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_unload_model_never_loaded_is_noop() {
        let engine = WhisperCppEngine::new(test_config());
        assert!(engine.unload_model("never-loaded").await.is_ok());
    }
}
