//! Configuration for the inference node.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;

/// Main configuration structure for the inference node.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub api: ApiConfig,
    /// Router connection config. Absent means standalone mode: no sync,
    /// no heartbeat, serve whatever is already in `storage.models_dir`.
    #[serde(default)]
    pub router: Option<RouterConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub engines: EnginesConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub machine_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of requests admitted concurrently across all capabilities.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

/// Router connection configuration: registration, heartbeat, catalog sync.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Base HTTP address of the router, e.g. "http://router.internal:9000".
    pub url: String,
    pub auth_token: String,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_models_dir")]
    pub models_dir: String,
    /// Optional read-only mirror of models managed outside this node (e.g. an
    /// Ollama model tree). Surfaced through `/api/tags` only; never
    /// participates in descriptor resolution or sync reconciliation.
    #[serde(default)]
    pub mirror_dir: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            mirror_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_sync_interval(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EnginesConfig {
    pub llama_cpp: Option<ProcessEngineConfig>,
    pub gptoss_cpp: Option<ProcessEngineConfig>,
    pub whisper_cpp: Option<ProcessEngineConfig>,
    pub onnx_runtime: Option<ProcessEngineConfig>,
    pub stable_diffusion: Option<ProcessEngineConfig>,
    /// Directory to scan for dynamically-loaded engine plugins (`.so`/`.dll`).
    #[serde(default)]
    pub plugin_dir: Option<String>,
    #[serde(default = "default_plugin_restart_interval")]
    pub plugin_restart_interval_secs: u64,
    #[serde(default = "default_plugin_restart_request_limit")]
    pub plugin_restart_request_limit: u32,
}

/// Shared configuration shape for every subprocess-managed engine.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessEngineConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory containing this engine's model files.
    pub model_dir: String,
    /// Path to the engine's server/CLI binary.
    pub server_binary: String,
    /// Number of layers to offload to GPU. 0 = CPU only.
    #[serde(default)]
    pub gpu_layers: Option<u32>,
    /// Context window size, where applicable.
    #[serde(default)]
    pub context_size: Option<u32>,
    /// Base port for server allocation. If unset, the OS assigns a port.
    #[serde(default)]
    pub base_port: Option<u16>,
    /// Maximum number of concurrent model servers for this engine.
    #[serde(default = "default_max_servers")]
    pub max_servers: usize,
    /// Per-model VRAM override, keyed by model name, in GB.
    #[serde(default)]
    pub model_memory_gb: HashMap<String, f32>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub log_server_output: bool,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourcesConfig {
    /// Hard ceiling on total VRAM usable across loaded models, in GB.
    #[serde(default)]
    pub max_vram_gb: Option<f32>,
    /// Hard ceiling on total host memory usable, in bytes.
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
    /// Fraction of `max_memory_bytes`/`max_vram_gb` above which the resource
    /// monitor starts evicting, even if the model manager's own admission
    /// check would have allowed the load.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: f32,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            max_vram_gb: None,
            max_memory_bytes: None,
            sample_interval_secs: default_sample_interval(),
            high_watermark: default_high_watermark(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub always_loaded: Vec<String>,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Hard cap on simultaneously loaded models, evicting LRU (excluding
    /// always-loaded models) when a new load would exceed it.
    #[serde(default = "default_max_loaded")]
    pub max_loaded_models: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            always_loaded: vec![],
            idle_timeout_secs: default_idle_timeout(),
            max_loaded_models: default_max_loaded(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_concurrent_requests() -> usize {
    32
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_models_dir() -> String {
    "./models".to_string()
}
fn default_sync_interval() -> u64 {
    60
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_max_loaded() -> usize {
    3
}
fn default_max_servers() -> usize {
    2
}
fn default_startup_timeout() -> u64 {
    120
}
fn default_shutdown_timeout() -> u64 {
    10
}
fn default_sample_interval() -> u64 {
    5
}
fn default_high_watermark() -> f32 {
    0.9
}
fn default_plugin_restart_interval() -> u64 {
    60
}
fn default_plugin_restart_request_limit() -> u32 {
    1000
}

impl Config {
    /// Load configuration from file, `RUNNER__SECTION__KEY`-style environment
    /// variables, and a final layer of flat env vars named directly in the
    /// node's external interface (they don't follow the nested convention so
    /// they're applied as overrides after deserialization).
    ///
    /// Precedence, highest first:
    /// 1. Flat env vars (`LLM_MODEL_IDLE_TIMEOUT`, ...)
    /// 2. `RUNNER__SECTION__KEY` environment variables
    /// 3. `config.toml` file, if present
    /// 4. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::builder()
            .set_default("api.host", default_host())?
            .set_default("api.port", default_port() as i64)?
            .set_default(
                "persistence.idle_timeout_secs",
                default_idle_timeout() as i64,
            )?
            .set_default("persistence.max_loaded_models", default_max_loaded() as i64)?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("RUNNER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = loader.try_deserialize()?;
        config.apply_flat_env_overrides();
        Ok(config)
    }

    fn apply_flat_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("LLM_MODEL_IDLE_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                self.persistence.idle_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("LLM_MAX_LOADED_MODELS") {
            if let Ok(n) = v.parse() {
                self.persistence.max_loaded_models = n;
            }
        }
        if let Ok(v) = std::env::var("LLM_MAX_MEMORY_BYTES") {
            if let Ok(bytes) = v.parse() {
                self.resources.max_memory_bytes = Some(bytes);
            }
        }
        if let Ok(v) = std::env::var("LLM_ROUTER_HOST") {
            if let Some(ref mut router) = self.router {
                router.url = v;
            }
        }
        if let Ok(v) = std::env::var("LLM_NODE_PORT") {
            if let Ok(port) = v.parse() {
                self.api.port = port;
            }
        }
        // LLM_NODE_GPTOSS_TRACE is read directly by the gpt-oss engine at
        // request time rather than stored here, since it's a debug toggle
        // that should be checkable without a config reload.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_api_config() {
        let api = ApiConfig::default();
        assert_eq!(api.host, "0.0.0.0");
        assert_eq!(api.port, 8080);
    }

    #[test]
    fn test_default_persistence_config() {
        let persistence = PersistenceConfig::default();
        assert!(persistence.always_loaded.is_empty());
        assert_eq!(persistence.idle_timeout_secs, 300);
        assert_eq!(persistence.max_loaded_models, 3);
    }

    #[test]
    fn test_default_resources_config_has_no_hard_caps() {
        let resources = ResourcesConfig::default();
        assert!(resources.max_vram_gb.is_none());
        assert!(resources.max_memory_bytes.is_none());
        assert_eq!(resources.high_watermark, 0.9);
    }

    #[test]
    fn test_flat_env_override_idle_timeout() {
        std::env::set_var("LLM_MODEL_IDLE_TIMEOUT", "42");
        let mut config = Config {
            node: NodeConfig {
                id: "n".to_string(),
                name: "n".to_string(),
                machine_type: None,
            },
            api: ApiConfig::default(),
            router: None,
            storage: StorageConfig::default(),
            sync: SyncConfig::default(),
            engines: EnginesConfig::default(),
            resources: ResourcesConfig::default(),
            persistence: PersistenceConfig::default(),
        };
        config.apply_flat_env_overrides();
        assert_eq!(config.persistence.idle_timeout_secs, 42);
        std::env::remove_var("LLM_MODEL_IDLE_TIMEOUT");
    }
}
