//! Inference engine abstraction layer.
//!
//! This module defines the `Engine` trait that abstracts different
//! model-serving backends (llama.cpp, gpt-oss, whisper.cpp, ...) behind a
//! common interface, generalized from a single-format contract into the full
//! `(format, architecture, capability)` resolution the registry uses.

pub mod gptoss_cpp;
pub mod llama_cpp;
pub mod onnx_runtime;
pub mod process;
pub mod registry;
pub mod stable_diffusion;
pub mod whisper_cpp;

pub use gptoss_cpp::GptOssCppEngine;
pub use llama_cpp::LlamaCppEngine;
pub use onnx_runtime::OnnxRuntimeEngine;
pub use registry::EngineRegistry;
pub use stable_diffusion::StableDiffusionEngine;
pub use whisper_cpp::WhisperCppEngine;

use async_trait::async_trait;
use node_protocol::{ChatCompletionRequest, ChatCompletionResponse, Capability, ModelDescriptor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Health status of an inference engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHealth {
    pub is_healthy: bool,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub models_loaded: Vec<String>,
}

/// Primary trait for model-serving engines.
///
/// Each engine implements this trait to provide a consistent interface for
/// model lifecycle management and inference across formats and capabilities.
/// Capability-specific generation methods default to `Unsupported` so an
/// engine only needs to implement the ones its `capabilities()` declare.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Unique identifier for this engine type (e.g., "llama_cpp", "gptoss_cpp").
    fn engine_type(&self) -> &'static str;

    /// Model file formats this engine can load (e.g. "gguf", "safetensors").
    fn formats(&self) -> &[&'static str];

    /// Architectures this engine is gated to, or `None` if it accepts any
    /// architecture within its declared formats.
    fn architectures(&self) -> Option<&[String]> {
        None
    }

    /// Capabilities this engine exposes.
    fn capabilities(&self) -> &[Capability];

    /// Maximum number of requests this engine serves concurrently per loaded
    /// model (default: 1 = no batching).
    fn batch_size(&self) -> u32 {
        1
    }

    /// Check if the engine's runtime (subprocess, plugin, library) is
    /// healthy and responding.
    async fn health_check(&self) -> Result<EngineHealth>;

    /// List all models this engine can see on disk.
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>>;

    /// Load a model into memory/a subprocess for inference. Idempotent: if
    /// the model is already loaded, returns immediately.
    async fn load_model(&self, descriptor: &ModelDescriptor) -> Result<()>;

    /// Final admission gate, checked after the registry has already matched
    /// format/architecture/capability: can this engine actually serve this
    /// specific descriptor? Default checks format and architecture again
    /// (cheap, and correct for engines overriding neither), rejects
    /// descriptors with no resolvable path, and rejects sharded safetensors
    /// descriptors missing shard files per their index.
    fn is_model_supported(&self, descriptor: &ModelDescriptor) -> bool {
        if !self.formats().contains(&descriptor.format.as_str()) {
            return false;
        }
        if let (Some(arch), Some(supported)) = (&descriptor.architecture, self.architectures()) {
            if !supported.iter().any(|a| a == arch) {
                return false;
            }
        }
        if descriptor.metadata.get("shards_complete").map(|v| v == "false").unwrap_or(false) {
            return false;
        }
        !descriptor.primary_path.is_empty()
    }

    /// Unload a model, freeing the memory/process it held.
    async fn unload_model(&self, model_id: &str) -> Result<()>;

    /// Estimated resident memory (VRAM if GPU-resident, else host RAM) for a
    /// loaded model, in GB. `None` if the model isn't loaded or the engine
    /// can't estimate it.
    async fn memory_usage_gb(&self, model_id: &str) -> Option<f32>;

    /// Estimated memory a descriptor would need once loaded, used for
    /// pre-admission checks before the model is actually resident. Default
    /// heuristic: file size plus 10% overhead, in GB.
    fn estimate_memory_gb(&self, descriptor: &ModelDescriptor) -> f32 {
        (descriptor.size_bytes as f32 / (1024.0 * 1024.0 * 1024.0)) * 1.1
    }

    async fn generate_chat(
        &self,
        model_id: &str,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let _ = (model_id, request);
        Err(Error::Unsupported(format!(
            "{} does not support chat generation",
            self.engine_type()
        )))
    }

    async fn generate_embeddings(&self, model_id: &str, input: &[&str]) -> Result<Vec<Vec<f32>>> {
        let _ = (model_id, input);
        Err(Error::Unsupported(format!(
            "{} does not support embeddings",
            self.engine_type()
        )))
    }

    /// Transcribe audio bytes to text (capability `AudioAsr`).
    async fn transcribe(&self, model_id: &str, audio: &[u8]) -> Result<String> {
        let _ = (model_id, audio);
        Err(Error::Unsupported(format!(
            "{} does not support transcription",
            self.engine_type()
        )))
    }

    /// Synthesize speech audio from text (capability `AudioTts`), returning
    /// encoded audio bytes.
    async fn synthesize_speech(&self, model_id: &str, text: &str) -> Result<Vec<u8>> {
        let _ = (model_id, text);
        Err(Error::Unsupported(format!(
            "{} does not support speech synthesis",
            self.engine_type()
        )))
    }

    /// Generate images from a text prompt (capability `Image`), returning
    /// PNG-encoded image bytes, one per requested image.
    async fn generate_images(&self, model_id: &str, prompt: &str, n: u32) -> Result<Vec<Vec<u8>>> {
        let _ = (model_id, prompt, n);
        Err(Error::Unsupported(format!(
            "{} does not support image generation",
            self.engine_type()
        )))
    }
}
