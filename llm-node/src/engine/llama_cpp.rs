//! llama.cpp inference engine: GGUF text and embeddings, one llama-server
//! subprocess per loaded model.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use node_protocol::{Capability, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ModelDescriptor};
use serde::{Deserialize, Serialize};

use super::process::{ProcessPool, ServerState, SpawnSpec};
use super::{Engine, EngineHealth};
use crate::config::ProcessEngineConfig;
use crate::error::{Error, Result};

pub struct LlamaCppEngine {
    config: ProcessEngineConfig,
    http_client: reqwest::Client,
    pool: ProcessPool,
    model_paths: tokio::sync::RwLock<HashMap<String, PathBuf>>,
}

impl LlamaCppEngine {
    pub fn new(config: ProcessEngineConfig) -> Self {
        let base_port = config.base_port;
        let search_range = config.max_servers.max(1) as u16 * 10;
        Self {
            pool: ProcessPool::new(base_port, search_range),
            http_client: reqwest::Client::new(),
            config,
            model_paths: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    fn discover_models(&self) -> HashMap<String, PathBuf> {
        let mut models = HashMap::new();
        let model_dir = PathBuf::from(&self.config.model_dir);
        if !model_dir.exists() {
            return models;
        }
        Self::scan_directory_recursive(&model_dir, &mut models);
        models
    }

    fn scan_directory_recursive(dir: &PathBuf, models: &mut HashMap<String, PathBuf>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                Self::scan_directory_recursive(&path, models);
            } else if path.extension().map_or(false, |ext| ext.eq_ignore_ascii_case("gguf")) {
                let filename = match path.file_name().and_then(|s| s.to_str()) {
                    Some(f) => f,
                    None => continue,
                };
                if Self::is_non_primary_shard(filename) {
                    continue;
                }
                let model_id = Self::create_model_id(filename);
                models.insert(model_id, path);
            }
        }
    }

    fn is_non_primary_shard(filename: &str) -> bool {
        if let Some(pos) = filename.find("-of-") {
            let prefix = &filename[..pos];
            if let Some(dash_pos) = prefix.rfind('-') {
                let shard_num = &prefix[dash_pos + 1..];
                if shard_num.chars().all(|c| c.is_ascii_digit()) && shard_num != "00001" {
                    return true;
                }
            }
        }
        false
    }

    fn create_model_id(filename: &str) -> String {
        let stem = filename.strip_suffix(".gguf").unwrap_or(filename);
        let clean = if let Some(pos) = stem.find("-00001-of-") {
            &stem[..pos]
        } else {
            stem
        };
        clean.to_string()
    }

    fn extract_quantization(filename: &str) -> Option<String> {
        let patterns = [
            "q2_k", "q3_k_s", "q3_k_m", "q3_k_l", "q4_0", "q4_1", "q4_k_s", "q4_k_m", "q5_0",
            "q5_1", "q5_k_s", "q5_k_m", "q6_k", "q8_0", "f16", "f32",
        ];
        let lower = filename.to_lowercase();
        for pattern in patterns {
            if lower.contains(pattern) {
                return Some(pattern.to_uppercase());
            }
        }
        None
    }

    async fn model_path(&self, model_id: &str) -> Option<PathBuf> {
        self.model_paths.read().await.get(model_id).cloned()
    }

    async fn refresh_model_cache(&self) {
        let discovered = self.discover_models();
        *self.model_paths.write().await = discovered;
    }

    async fn model_memory_gb(&self, model_id: &str) -> f32 {
        if let Some(&memory) = self.config.model_memory_gb.get(model_id) {
            return memory;
        }
        if let Some(path) = self.model_path(model_id).await {
            if let Ok(metadata) = std::fs::metadata(&path) {
                let size_gb = metadata.len() as f32 / (1024.0 * 1024.0 * 1024.0);
                return size_gb * 1.1;
            }
        }
        4.0
    }

    /// Evict this engine's own least-recently-used servers until its local
    /// server-count cap allows the new model. Cross-engine VRAM eviction is
    /// the model manager's job.
    async fn ensure_local_capacity(&self, model_to_load: &str) -> Result<()> {
        loop {
            if self.pool.running_count().await < self.config.max_servers {
                return Ok(());
            }
            match self.pool.find_lru(model_to_load).await {
                Some((model_id, _)) => {
                    tracing::info!(
                        "evicting lru model {} to make room for {} (max_servers={})",
                        model_id,
                        model_to_load,
                        self.config.max_servers
                    );
                    self.unload_model(&model_id).await?;
                }
                None => {
                    return Err(Error::ResourceExhausted(format!(
                        "cannot make room for {}: at capacity ({}) with no evictable servers",
                        model_to_load, self.config.max_servers
                    )));
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct LlamaChatRequest {
    model: String,
    messages: Vec<LlamaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct LlamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct LlamaChatResponse {
    choices: Vec<LlamaChoice>,
    #[serde(default)]
    usage: Option<LlamaUsage>,
}

#[derive(Debug, Deserialize)]
struct LlamaChoice {
    message: LlamaResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlamaResponseMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct LlamaUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Serialize)]
struct LlamaEmbeddingRequest<'a> {
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct LlamaEmbeddingResponse {
    data: Vec<LlamaEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct LlamaEmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl Engine for LlamaCppEngine {
    fn engine_type(&self) -> &'static str {
        "llama_cpp"
    }

    fn formats(&self) -> &[&'static str] {
        &["gguf"]
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Text, Capability::Embeddings]
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
                "llama-server binary not found: {}",
                self.config.server_binary
            )));
        }

        Ok(EngineHealth {
            is_healthy: true,
            version: Some("llama.cpp".to_string()),
            models_loaded: self.pool.loaded_ready_ids().await,
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.refresh_model_cache().await;
        let paths = self.model_paths.read().await;
        let mut models = Vec::new();

        for (model_id, path) in paths.iter() {
            let filename = path.file_name().and_then(|s| s.to_str()).unwrap_or("unknown");
            let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            let quantization = Self::extract_quantization(filename);

            models.push(ModelDescriptor {
                name: model_id.clone(),
                format: "gguf".to_string(),
                architecture: None,
                capabilities: vec![Capability::Text, Capability::Embeddings],
                size_bytes,
                quantization,
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

        let model_id = descriptor.name.clone();
        let model_path = if descriptor.primary_path.is_empty() {
            self.model_path(&model_id)
                .await
                .ok_or_else(|| Error::NotFound(format!("model not found: {}", model_id)))?
        } else {
            PathBuf::from(&descriptor.primary_path)
        };

        if !model_path.exists() {
            return Err(Error::NotFound(format!("model file not found: {}", model_path.display())));
        }

        let memory_gb = self.model_memory_gb(&model_id).await;
        self.ensure_local_capacity(&model_id).await?;

        let config = &self.config;
        let gpu_layers = config.gpu_layers;
        let context_size = config.context_size;
        let extra_args = config.extra_args.clone();
        let log_output = config.log_server_output;
        let binary = PathBuf::from(&config.server_binary);

        self.pool
            .ensure_server(
                &model_id,
                memory_gb,
                config.startup_timeout_secs,
                "/health",
                move |port| {
                    let mut args = vec![
                        "-m".to_string(),
                        model_path.display().to_string(),
                        "--host".to_string(),
                        "127.0.0.1".to_string(),
                        "--port".to_string(),
                        port.to_string(),
                    ];
                    if let Some(gpu_layers) = gpu_layers {
                        args.push("-ngl".to_string());
                        args.push(gpu_layers.to_string());
                    }
                    if let Some(ctx) = context_size {
                        args.push("-c".to_string());
                        args.push(ctx.to_string());
                    }
                    args.extend(extra_args);
                    Ok(SpawnSpec { binary, args, port, log_output })
                },
            )
            .await?;

        tracing::info!("model {} loaded via llama.cpp", model_id);
        Ok(())
    }

    async fn unload_model(&self, model_id: &str) -> Result<()> {
        self.pool.stop(model_id, self.config.shutdown_timeout_secs).await;
        tracing::info!("model {} unloaded from llama.cpp", model_id);
        Ok(())
    }

    async fn memory_usage_gb(&self, model_id: &str) -> Option<f32> {
        self.pool.get(model_id).await.map(|s| s.memory_gb)
    }

    async fn generate_chat(
        &self,
        model_id: &str,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let instance = self
            .pool
            .get(model_id)
            .await
            .ok_or_else(|| Error::Unavailable(format!("{} is not loaded", model_id)))?;

        if instance.state().await != ServerState::Ready {
            return Err(Error::Unavailable(format!("llama-server for {} is not ready", model_id)));
        }

        let messages: Vec<LlamaMessage> = request
            .messages
            .iter()
            .map(|m| LlamaMessage {
                role: m.role.clone(),
                content: m.content_as_text().unwrap_or_default(),
            })
            .collect();

        let llama_request = LlamaChatRequest {
            model: model_id.to_string(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
        };

        let url = format!("http://127.0.0.1:{}/v1/chat/completions", instance.port);
        let response = self.http_client.post(&url).json(&llama_request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!("llama-server error {}: {}", status, body)));
        }

        let llama_response: LlamaChatResponse =
            response.json().await.map_err(|e| Error::Internal(e.to_string()))?;

        let choice = llama_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal("no choices in llama-server response".to_string()))?;

        let message = ChatMessage::text(choice.message.role, choice.message.content);
        let mut response = ChatCompletionResponse::new(model_id.to_string(), message, choice.finish_reason);

        if let Some(usage) = llama_response.usage {
            response = response.with_usage(usage.prompt_tokens, usage.completion_tokens);
        }

        instance.touch().await;
        Ok(response)
    }

    async fn generate_embeddings(&self, model_id: &str, input: &[&str]) -> Result<Vec<Vec<f32>>> {
        let instance = self
            .pool
            .get(model_id)
            .await
            .ok_or_else(|| Error::Unavailable(format!("{} is not loaded", model_id)))?;

        let url = format!("http://127.0.0.1:{}/v1/embeddings", instance.port);
        let response = self
            .http_client
            .post(&url)
            .json(&LlamaEmbeddingRequest { input: input.to_vec() })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Internal(format!("llama-server embeddings error: {}", status)));
        }

        let parsed: LlamaEmbeddingResponse = response.json().await.map_err(|e| Error::Internal(e.to_string()))?;
        instance.touch().await;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProcessEngineConfig {
        ProcessEngineConfig {
            enabled: true,
            model_dir: "/tmp/llm-node-test-models".to_string(),
            server_binary: "/usr/bin/llama-server".to_string(),
            gpu_layers: Some(35),
            context_size: Some(4096),
            base_port: None,
            max_servers: 2,
            model_memory_gb: HashMap::new(),
            startup_timeout_secs: 120,
            shutdown_timeout_secs: 10,
            log_server_output: false,
            extra_args: vec![],
        }
    }

    #[test]
    fn test_engine_type_and_formats() {
        let engine = LlamaCppEngine::new(test_config());
        assert_eq!(engine.engine_type(), "llama_cpp");
        assert_eq!(engine.formats(), &["gguf"]);
    }

    #[test]
    fn test_is_non_primary_shard() {
        assert!(!LlamaCppEngine::is_non_primary_shard("model-00001-of-00002.gguf"));
        assert!(LlamaCppEngine::is_non_primary_shard("model-00002-of-00002.gguf"));
        assert!(!LlamaCppEngine::is_non_primary_shard("model.gguf"));
    }

    #[test]
    fn test_create_model_id() {
        assert_eq!(LlamaCppEngine::create_model_id("llama-7b-q4_0.gguf"), "llama-7b-q4_0");
        assert_eq!(
            LlamaCppEngine::create_model_id("gpt-oss-120b-Q4_K_M-00001-of-00002.gguf"),
            "gpt-oss-120b-Q4_K_M"
        );
    }

    #[test]
    fn test_extract_quantization() {
        assert_eq!(LlamaCppEngine::extract_quantization("llama-7b-q4_0.gguf"), Some("Q4_0".to_string()));
        assert_eq!(LlamaCppEngine::extract_quantization("model.gguf"), None);
    }

    #[tokio::test]
    async fn test_health_check_missing_model_dir() {
        let mut config = test_config();
        config.model_dir = "/nonexistent/path".to_string();
        let engine = LlamaCppEngine::new(config);
        assert!(engine.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_list_models_missing_dir_is_empty() {
        let mut config = test_config();
        config.model_dir = "/nonexistent/path".to_string();
        let engine = LlamaCppEngine::new(config);
        let models = engine.list_models().await.unwrap();
        assert!(models.is_empty());
    }

    #[tokio::test]
    async fn test_load_model_file_not_found() {
        let engine = LlamaCppEngine::new(test_config());
        let descriptor = ModelDescriptor {
            name: "nonexistent-model".to_string(),
            format: "gguf".to_string(),
            architecture: None,
            capabilities: vec![Capability::Text],
            size_bytes: 0,
            quantization: None,
            modified_at: None,
            model_dir: String::new(),
            primary_path: String::new(),
            runtime: None,
            metadata: HashMap::new(),
        };
        let result = engine.load_model(&descriptor).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unload_model_never_loaded_is_noop() {
        let engine = LlamaCppEngine::new(test_config());
        assert!(engine.unload_model("never-loaded").await.is_ok());
    }

    #[tokio::test]
    async fn test_model_memory_gb_from_config_override() {
        let mut config = test_config();
        config.model_memory_gb.insert("test-model".to_string(), 8.5);
        let engine = LlamaCppEngine::new(config);
        let memory = engine.model_memory_gb("test-model").await;
        assert!((memory - 8.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_model_memory_gb_default_fallback() {
        let engine = LlamaCppEngine::new(test_config());
        let memory = engine.model_memory_gb("nonexistent").await;
        assert!((memory - 4.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_ensure_local_capacity_within_limit_is_ok() {
        let engine = LlamaCppEngine::new(test_config());
        assert!(engine.ensure_local_capacity("new-model").await.is_ok());
    }
}
