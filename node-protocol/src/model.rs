//! `/v1/models` (OpenAI-compatible) and `/api/tags`, `/api/ps`, `/api/show`
//! (Ollama-compatible) listing types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::Capability;

/// `GET /v1/models` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelData {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// A descriptor for a model discovered on disk, independent of wire format.
/// Shared between Model Storage, the registry's resolution step, and the
/// `/api/tags`/`/api/show` handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub format: String,
    #[serde(default)]
    pub architecture: Option<String>,
    pub capabilities: Vec<Capability>,
    pub size_bytes: u64,
    #[serde(default)]
    pub quantization: Option<String>,
    #[serde(default)]
    pub modified_at: Option<String>,
    /// Directory on disk holding this model's files. Empty when the
    /// descriptor wasn't built from a storage scan (e.g. a synthetic
    /// descriptor constructed for a test or plugin probe).
    #[serde(default)]
    pub model_dir: String,
    /// Path to the entry point a loader should open: a single weight file
    /// for file-based formats, or the bundle directory itself for engines
    /// that load a whole directory. Engines resolve models through this
    /// field rather than re-deriving a path from `name`.
    #[serde(default)]
    pub primary_path: String,
    /// Explicit engine hint from the router catalog or a manifest, e.g.
    /// `"llama_cpp"`. When set, engine resolution prefers the engine whose
    /// `engine_type()` matches this over the lexicographic tie-break.
    #[serde(default)]
    pub runtime: Option<String>,
    /// Free-form descriptor metadata, e.g. `shards_complete` for sharded
    /// safetensors models.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl From<ModelDescriptor> for ModelData {
    fn from(d: ModelDescriptor) -> Self {
        ModelData {
            id: d.name,
            object: "model".to_string(),
            created: 0,
            owned_by: "local".to_string(),
        }
    }
}

/// `GET /api/tags` response (Ollama-compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagsResponse {
    pub models: Vec<TagEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagEntry {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: Option<String>,
}

/// `GET /api/ps` response: currently loaded models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsResponse {
    pub models: Vec<PsEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsEntry {
    pub name: String,
    pub capability: Capability,
    #[serde(default)]
    pub size_vram: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// `POST /api/show` response: details for a single model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowResponse {
    pub name: String,
    pub format: String,
    #[serde(default)]
    pub architecture: Option<String>,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

/// Body of `POST /api/models/pull`: ask the node to sync a model from the
/// router ahead of time, instead of lazily on first request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub name: String,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullStatus {
    pub status: String,
    #[serde(default)]
    pub downloaded_bytes: Option<u64>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_descriptor_into_model_data() {
        let descriptor = ModelDescriptor {
            name: "llama-3-8b".to_string(),
            format: "gguf".to_string(),
            architecture: Some("Llama".to_string()),
            capabilities: vec![Capability::Text],
            size_bytes: 4_000_000_000,
            quantization: Some("Q4_K_M".to_string()),
            modified_at: None,
            model_dir: "/models/llama-3-8b".to_string(),
            primary_path: "/models/llama-3-8b/model.gguf".to_string(),
            runtime: None,
            metadata: HashMap::new(),
        };
        let data: ModelData = descriptor.into();
        assert_eq!(data.id, "llama-3-8b");
        assert_eq!(data.object, "model");
    }

    #[test]
    fn test_pull_status_serialization() {
        let status = PullStatus {
            status: "downloading".to_string(),
            downloaded_bytes: Some(100),
            total_bytes: Some(1000),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains(r#""status":"downloading""#));
    }
}
