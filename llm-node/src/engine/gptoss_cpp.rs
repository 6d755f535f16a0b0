//! gpt-oss inference engine: GGUF text generation via llama.cpp's
//! gpt-oss fork, gated to the `GptOssForCausalLM` architecture. Shares
//! `ProcessPool` with the llama.cpp engine but keeps its own process set,
//! since gpt-oss servers are spawned from a distinct binary and may run a
//! harmony-channel-aware build.
//!
//! The raw harmony-tagged text (with `<|channel|>`/`<|message|>`/`<|end|>`
//! markers) is returned as-is; extracting the final channel and applying
//! stop sequences is the inference facade's job, not this engine's, so the
//! same post-processing logic applies uniformly regardless of which engine
//! produced the architecture match.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use node_protocol::{Capability, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ModelDescriptor};
use serde::{Deserialize, Serialize};

use super::process::{ProcessPool, ServerState, SpawnSpec};
use super::{Engine, EngineHealth};
use crate::config::ProcessEngineConfig;
use crate::error::{Error, Result};

const GPTOSS_ARCHITECTURE: &str = "GptOssForCausalLM";

pub struct GptOssCppEngine {
    config: ProcessEngineConfig,
    http_client: reqwest::Client,
    pool: ProcessPool,
    model_paths: tokio::sync::RwLock<HashMap<String, PathBuf>>,
    architectures: Vec<String>,
}

impl GptOssCppEngine {
    pub fn new(config: ProcessEngineConfig) -> Self {
        let base_port = config.base_port;
        let search_range = config.max_servers.max(1) as u16 * 10;
        Self {
            pool: ProcessPool::new(base_port, search_range),
            http_client: reqwest::Client::new(),
            config,
            model_paths: tokio::sync::RwLock::new(HashMap::new()),
            architectures: vec![GPTOSS_ARCHITECTURE.to_string()],
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
struct GptOssChatRequest {
    model: String,
    messages: Vec<GptOssMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct GptOssMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct GptOssChatResponse {
    choices: Vec<GptOssChoice>,
    #[serde(default)]
    usage: Option<GptOssUsage>,
}

#[derive(Debug, Deserialize)]
struct GptOssChoice {
    message: GptOssResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GptOssResponseMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct GptOssUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[async_trait]
impl Engine for GptOssCppEngine {
    fn engine_type(&self) -> &'static str {
        "gptoss_cpp"
    }

    fn formats(&self) -> &[&'static str] {
        &["gguf"]
    }

    fn architectures(&self) -> Option<&[String]> {
        Some(&self.architectures)
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Text]
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
                "gpt-oss server binary not found: {}",
                self.config.server_binary
            )));
        }

        Ok(EngineHealth {
            is_healthy: true,
            version: Some("gpt-oss".to_string()),
            models_loaded: self.pool.loaded_ready_ids().await,
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
                format: "gguf".to_string(),
                architecture: Some(GPTOSS_ARCHITECTURE.to_string()),
                capabilities: vec![Capability::Text],
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

        tracing::info!("model {} loaded via gpt-oss", model_id);
        Ok(())
    }

    async fn unload_model(&self, model_id: &str) -> Result<()> {
        self.pool.stop(model_id, self.config.shutdown_timeout_secs).await;
        tracing::info!("model {} unloaded from gpt-oss", model_id);
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
            return Err(Error::Unavailable(format!("gpt-oss server for {} is not ready", model_id)));
        }

        let messages: Vec<GptOssMessage> = request
            .messages
            .iter()
            .map(|m| GptOssMessage {
                role: m.role.clone(),
                content: m.content_as_text().unwrap_or_default(),
            })
            .collect();

        let gptoss_request = GptOssChatRequest {
            model: model_id.to_string(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
        };

        let url = format!("http://127.0.0.1:{}/v1/chat/completions", instance.port);
        let response = self.http_client.post(&url).json(&gptoss_request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Internal(format!("gpt-oss server error {}: {}", status, body)));
        }

        let gptoss_response: GptOssChatResponse =
            response.json().await.map_err(|e| Error::Internal(e.to_string()))?;

        let choice = gptoss_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal("no choices in gpt-oss server response".to_string()))?;

        let message = ChatMessage::text(choice.message.role, choice.message.content);
        let mut response = ChatCompletionResponse::new(model_id.to_string(), message, choice.finish_reason);

        if let Some(usage) = gptoss_response.usage {
            response = response.with_usage(usage.prompt_tokens, usage.completion_tokens);
        }

        instance.touch().await;
        Ok(response)
    }
}
