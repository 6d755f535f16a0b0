//! Wire types for node-to-router communication.
//!
//! The node talks to the router over plain HTTP rather than a persistent
//! socket: it registers once, polls the router's model catalog, downloads
//! blobs by name, and posts periodic health reports. This module defines
//! the JSON bodies for those calls.
//!
//! ## Flow
//!
//! 1. Node starts, calls `POST /v0/nodes` with a [`NodeRegistration`].
//! 2. Node polls `GET /v0/models` for a [`ModelCatalog`] and reconciles it
//!    against local storage (model sync).
//! 3. Node downloads missing blobs from `GET /v0/models/blob/<name>`.
//! 4. Node posts a [`NodeHealthReport`] to `POST /v0/health` on every
//!    heartbeat tick.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::Capability;

/// Body of `POST /v0/nodes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    /// Unique node identifier.
    pub node_id: String,
    /// Human-readable node name.
    pub node_name: String,
    /// Machine type for routing decisions (e.g., "gpu-server", "strix-halo").
    #[serde(default)]
    pub machine_type: Option<String>,
    /// HTTP address the node's OpenAI-compatible API listens on.
    pub address: String,
    /// Capabilities this node can serve, independent of what's loaded right now.
    pub capabilities: Vec<Capability>,
}

/// Response body of `POST /v0/nodes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistrationResponse {
    /// Token the node must attach as `X-Node-Token` on subsequent catalog and
    /// health calls.
    pub node_token: String,
}

/// Body of `POST /v0/health`, sent on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHealthReport {
    pub node_id: String,
    pub status: NodeHealth,
    pub loaded_models: LoadedModels,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub metrics: Option<NodeMetrics>,
}

/// Current health state of the node, as reported to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    /// All registered engines healthy and ready.
    Healthy,
    /// Some engines degraded but the node still serves requests.
    Degraded,
    /// Node is starting up, not yet ready to accept requests.
    Starting,
    /// Critical failure; the router should stop routing here.
    Unhealthy,
}

impl NodeHealth {
    pub fn is_operational(&self) -> bool {
        matches!(self, NodeHealth::Healthy | NodeHealth::Degraded)
    }
}

/// Model ids currently loaded, grouped by capability family.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadedModels {
    #[serde(default)]
    pub llm: Vec<String>,
    #[serde(default)]
    pub asr: Vec<String>,
    #[serde(default)]
    pub tts: Vec<String>,
    #[serde(default)]
    pub image_gen: Vec<String>,
}

/// Where the node's local model sync currently stands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    /// True while a download driven by model sync is in progress.
    #[serde(default)]
    pub syncing: bool,
    /// Number of models pending download.
    #[serde(default)]
    pub pending: u32,
    /// Most recent sync error, if any, left populated until the next successful sync.
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Host telemetry attached to a health report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetrics {
    #[serde(default)]
    pub requests_in_flight: u32,
    #[serde(default)]
    pub memory_used_bytes: Option<u64>,
    #[serde(default)]
    pub memory_total_bytes: Option<u64>,
    #[serde(default)]
    pub gpu_memory_used_bytes: Option<u64>,
    #[serde(default)]
    pub gpu_memory_total_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_usage_percent: Option<f32>,
}

/// Response body of `GET /v0/models`: the router's view of models available
/// for nodes to sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub models: Vec<ModelManifestEntry>,
}

/// A single model entry in the router's catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifestEntry {
    /// Canonical model name used in `loadModel`/requests.
    pub name: String,
    /// File format, e.g. "gguf", "safetensors", "onnx".
    pub format: String,
    /// Model architecture tag, e.g. "Llama", "GptOssForCausalLM".
    #[serde(default)]
    pub architecture: Option<String>,
    /// Capabilities this model supports.
    pub capabilities: Vec<Capability>,
    /// Total size across all files, in bytes.
    pub size_bytes: u64,
    /// Per-file etag, keyed by file name, used for conditional re-download.
    #[serde(default)]
    pub files: HashMap<String, ManifestFile>,
    /// If set, the router already has this model mounted at a path shared
    /// with the node (e.g. a common network volume) and no download is
    /// needed; the node should symlink/reference it directly.
    #[serde(default)]
    pub shared_path: Option<String>,
    /// Router-relative path identifying this entry, e.g. "meta-llama/llama-3-8b".
    #[serde(default)]
    pub path: Option<String>,
    /// Base URL to download this model's files from, when it differs from
    /// the router's default blob endpoint.
    #[serde(default)]
    pub download_url: Option<String>,
    /// Chat template (Jinja2) to apply before sending the model raw text,
    /// for engines that don't embed their own template.
    #[serde(default)]
    pub chat_template: Option<String>,
}

/// One file within a model's manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub etag: String,
    pub size_bytes: u64,
    /// Byte offset/length of this file within a shared archive, if it isn't
    /// downloaded as a standalone object.
    #[serde(default)]
    pub chunk: Option<ChunkRange>,
    /// Per-file download rate cap in bytes/sec. `None` means unlimited.
    #[serde(default)]
    pub max_bps: Option<u64>,
    /// Relative download priority within the model (higher downloads with
    /// more concurrency slots); defaults to 0.
    #[serde(default)]
    pub priority: u32,
    /// Content digest (e.g. "sha256:...") to verify the download against.
    #[serde(default)]
    pub digest: Option<String>,
    /// Direct download URL for this file, overriding the entry's `download_url`.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRange {
    pub offset: u64,
    pub length: u64,
}
