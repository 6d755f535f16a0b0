//! Stable Diffusion inference engine: safetensors checkpoints serving image
//! generation via a one-shot CLI invocation per request, writing one PNG
//! file per requested image.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use node_protocol::{Capability, ModelDescriptor};
use tokio::process::Command;

use super::{Engine, EngineHealth};
use crate::config::ProcessEngineConfig;
use crate::error::{Error, Result};

pub struct StableDiffusionEngine {
    config: ProcessEngineConfig,
    model_paths: tokio::sync::RwLock<HashMap<String, PathBuf>>,
    loaded: tokio::sync::RwLock<std::collections::HashSet<String>>,
}

impl StableDiffusionEngine {
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
        let Ok(entries) = std::fs::read_dir(&model_dir) else { return models };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() || !path.extension().map_or(false, |e| e.eq_ignore_ascii_case("safetensors")) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            models.insert(stem.to_string(), path);
        }
        models
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
impl Engine for StableDiffusionEngine {
    fn engine_type(&self) -> &'static str {
        "stable_diffusion"
    }

    fn formats(&self) -> &[&'static str] {
        &["safetensors"]
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Image]
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
                "sd-cli binary not found: {}",
                self.config.server_binary
            )));
        }

        Ok(EngineHealth {
            is_healthy: true,
            version: Some("stable-diffusion.cpp".to_string()),
            models_loaded: self.loaded.read().await.iter().cloned().collect(),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.refresh_model_cache().await;
        let paths = self.model_paths.read().await;
        let mut models = Vec::new();

        for (model_id, path) in paths.iter() {
            let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            models.push(ModelDescriptor {
                name: model_id.clone(),
                format: "safetensors".to_string(),
                architecture: None,
                capabilities: vec![Capability::Image],
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
        tracing::info!("model {} registered for on-demand image generation", descriptor.name);
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

    async fn generate_images(&self, model_id: &str, prompt: &str, n: u32) -> Result<Vec<Vec<u8>>> {
        if !self.loaded.read().await.contains(model_id) {
            return Err(Error::Unavailable(format!("{} is not loaded", model_id)));
        }
        let model_path = self
            .model_path(model_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("model not found: {}", model_id)))?;

        let tmp_dir = std::env::temp_dir();
        let mut images = Vec::with_capacity(n as usize);

        for i in 0..n {
            let seed = uuid::Uuid::new_v4().as_u128() as i64 ^ (i as i64);
            let output_path = tmp_dir.join(format!("llm-node-sd-{}-{}.png", uuid::Uuid::new_v4(), i));

            let output = Command::new(&self.config.server_binary)
                .arg("-m")
                .arg(&model_path)
                .arg("-p")
                .arg(prompt)
                .arg("-s")
                .arg(seed.to_string())
                .arg("-o")
                .arg(&output_path)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| Error::Unavailable(format!("failed to run sd-cli for {}: {}", model_id, e)))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let _ = tokio::fs::remove_file(&output_path).await;
                return Err(Error::Internal(format!("sd-cli exited with {}: {}", output.status, stderr)));
            }

            let bytes = tokio::fs::read(&output_path).await.map_err(Error::from)?;
            let _ = tokio::fs::remove_file(&output_path).await;
            images.push(bytes);
        }

        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProcessEngineConfig {
        ProcessEngineConfig {
            enabled: true,
            model_dir: "/tmp/llm-node-test-sd-models".to_string(),
            server_binary: "/usr/bin/sd-cli".to_string(),
            gpu_layers: None,
            context_size: None,
            base_port: None,
            max_servers: 1,
            model_memory_gb: HashMap::new(),
            startup_timeout_secs: 60,
            shutdown_timeout_secs: 5,
            log_server_output: false,
            extra_args: vec![],
        }
    }

    #[test]
    fn test_engine_type_and_capabilities() {
        let engine = StableDiffusionEngine::new(test_config());
        assert_eq!(engine.engine_type(), "stable_diffusion");
        assert_eq!(engine.capabilities(), &[Capability::Image]);
    }

    #[tokio::test]
    async fn test_list_models_discovers_safetensors() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("sdxl-base.safetensors"), b"x").unwrap();
        let mut config = test_config();
        config.model_dir = tmp.path().display().to_string();
        let engine = StableDiffusionEngine::new(config);

        let models = engine.list_models().await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "sdxl-base");
    }

    #[tokio::test]
    async fn test_generate_images_requires_loaded_model() {
        let engine = StableDiffusionEngine::new(test_config());
        let result = engine.generate_images("never-loaded", "a cat", 1).await;
        assert!(matches!(result, Err(Error::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_load_model_missing_file_not_found() {
        let engine = StableDiffusionEngine::new(test_config());
        let descriptor = ModelDescriptor {
            name: "nonexistent".to_string(),
            format: "safetensors".to_string(),
            architecture: None,
            capabilities: vec![Capability::Image],
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
}
