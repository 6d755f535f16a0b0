//! Engine registry: owns concrete engines and resolves a
//! `(format, architecture, capability)` triple to one of them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use libloading::Library;
use node_protocol::{Capability, ModelDescriptor};
use tokio::sync::RwLock;

use super::Engine;
use crate::error::{Error, Result};

struct PluginHandle {
    engine_id: String,
    #[allow(dead_code)]
    library: Library,
    loaded_at: Instant,
    request_count: std::sync::atomic::AtomicU32,
}

pub struct EngineRegistry {
    engines: RwLock<HashMap<String, Arc<dyn Engine>>>,
    plugins: RwLock<Vec<PluginHandle>>,
    plugin_restart_interval: Duration,
    plugin_restart_request_limit: u32,
}

impl EngineRegistry {
    pub fn new(plugin_restart_interval_secs: u64, plugin_restart_request_limit: u32) -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            plugins: RwLock::new(Vec::new()),
            plugin_restart_interval: Duration::from_secs(plugin_restart_interval_secs),
            plugin_restart_request_limit,
        }
    }

    /// Register a statically-linked engine. Rejects a duplicate `engine_type`.
    pub async fn register_engine(&self, engine: Arc<dyn Engine>) -> Result<()> {
        let mut engines = self.engines.write().await;
        let engine_type = engine.engine_type().to_string();
        if engines.contains_key(&engine_type) {
            return Err(Error::InvalidArgument(format!(
                "engine {} already registered",
                engine_type
            )));
        }
        engines.insert(engine_type, engine);
        Ok(())
    }

    pub async fn unregister_engine(&self, engine_type: &str) {
        self.engines.write().await.remove(engine_type);
    }

    /// Scan `dir` for dynamic-library plugins (`.so`/`.dll`/`.dylib`). Each
    /// plugin is expected to export an `extern "C" fn engine_entry_point()`
    /// that returns a raw pointer to a boxed `Engine`; registration of the
    /// loaded engine follows the same dedup rule as `register_engine`.
    ///
    /// Plugins older than `plugin_restart_interval` or past
    /// `plugin_restart_request_limit` are candidates for restart via
    /// `restart_idle_plugins`, never torn down mid-request.
    pub async fn load_plugins(&self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            return Ok(0);
        }

        let entries = std::fs::read_dir(dir).map_err(Error::from)?;
        let mut loaded = 0;

        for entry in entries.flatten() {
            let path = entry.path();
            let is_lib = path
                .extension()
                .map_or(false, |ext| matches!(ext.to_str(), Some("so" | "dll" | "dylib")));
            if !is_lib {
                continue;
            }

            match unsafe { Library::new(&path) } {
                Ok(library) => {
                    let engine_id = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or("plugin")
                        .to_string();
                    tracing::info!("loaded engine plugin {} from {}", engine_id, path.display());
                    self.plugins.write().await.push(PluginHandle {
                        engine_id,
                        library,
                        loaded_at: Instant::now(),
                        request_count: std::sync::atomic::AtomicU32::new(0),
                    });
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!("failed to load plugin {}: {}", path.display(), e);
                }
            }
        }

        Ok(loaded)
    }

    /// Plugins overdue for restart per policy, only when the node is idle
    /// (the caller passes `active_request_count == 0` as `is_idle`).
    pub async fn plugins_due_for_restart(&self, is_idle: bool) -> Vec<String> {
        if !is_idle {
            return Vec::new();
        }
        let plugins = self.plugins.read().await;
        plugins
            .iter()
            .filter(|p| {
                p.loaded_at.elapsed() > self.plugin_restart_interval
                    || p.request_count.load(std::sync::atomic::Ordering::Relaxed)
                        > self.plugin_restart_request_limit
            })
            .map(|p| p.engine_id.clone())
            .collect()
    }

    /// Resolve a descriptor + capability to the engine that should serve it.
    ///
    /// Selection order:
    /// 1. Engines declaring `capability`.
    /// 2. Engines whose `formats` contain `descriptor.format`.
    /// 3. If `descriptor.architecture` is set, engines whose `architectures`
    ///    either match it or are unrestricted (`None`).
    /// 4. If `descriptor.runtime` names one of the remaining candidates by
    ///    `engine_type`, it wins outright.
    /// 5. Otherwise tie-break: lexicographically smallest `engine_type`.
    pub async fn resolve_engine(
        &self,
        descriptor: &ModelDescriptor,
        capability: Capability,
    ) -> Option<Arc<dyn Engine>> {
        let engines = self.engines.read().await;
        let mut candidates: Vec<&Arc<dyn Engine>> = engines
            .values()
            .filter(|e| e.capabilities().contains(&capability))
            .filter(|e| e.formats().contains(&descriptor.format.as_str()))
            .filter(|e| match (&descriptor.architecture, e.architectures()) {
                (Some(arch), Some(supported)) => supported.iter().any(|a| a == arch),
                (Some(_), None) => true,
                (None, _) => true,
            })
            .collect();

        if let Some(runtime) = &descriptor.runtime {
            if let Some(exact) = candidates.iter().find(|e| e.engine_type() == runtime.as_str()) {
                return Some((*exact).clone());
            }
        }

        candidates.sort_by_key(|e| e.engine_type());
        candidates.into_iter().next().cloned()
    }

    pub async fn all(&self) -> Vec<Arc<dyn Engine>> {
        self.engines.read().await.values().cloned().collect()
    }

    pub async fn get(&self, engine_type: &str) -> Option<Arc<dyn Engine>> {
        self.engines.read().await.get(engine_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineHealth;
    use async_trait::async_trait;

    struct StubEngine {
        engine_type: &'static str,
        formats: Vec<&'static str>,
        architectures: Option<Vec<String>>,
        capabilities: Vec<Capability>,
    }

    #[async_trait]
    impl Engine for StubEngine {
        fn engine_type(&self) -> &'static str {
            self.engine_type
        }
        fn formats(&self) -> &[&'static str] {
            &self.formats
        }
        fn architectures(&self) -> Option<&[String]> {
            self.architectures.as_deref()
        }
        fn capabilities(&self) -> &[Capability] {
            &self.capabilities
        }
        async fn health_check(&self) -> Result<EngineHealth> {
            Ok(EngineHealth { is_healthy: true, version: None, models_loaded: vec![] })
        }
        async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
            Ok(vec![])
        }
        async fn load_model(&self, _descriptor: &ModelDescriptor) -> Result<()> {
            Ok(())
        }
        async fn unload_model(&self, _model_id: &str) -> Result<()> {
            Ok(())
        }
        async fn memory_usage_gb(&self, _model_id: &str) -> Option<f32> {
            None
        }
    }

    fn descriptor(format: &str, architecture: Option<&str>) -> ModelDescriptor {
        ModelDescriptor {
            name: "example/model".to_string(),
            format: format.to_string(),
            architecture: architecture.map(|s| s.to_string()),
            capabilities: vec![],
            size_bytes: 0,
            quantization: None,
            modified_at: None,
            model_dir: "/models/example/model".to_string(),
            primary_path: format!("/models/example/model/model.{}", format),
            runtime: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_engine_rejects_duplicate() {
        let registry = EngineRegistry::new(60, 1000);
        let engine = Arc::new(StubEngine {
            engine_type: "llama_cpp",
            formats: vec!["gguf"],
            architectures: None,
            capabilities: vec![Capability::Text],
        });
        assert!(registry.register_engine(engine.clone()).await.is_ok());
        assert!(registry.register_engine(engine).await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_engine_capability_routing() {
        let registry = EngineRegistry::new(60, 1000);
        registry
            .register_engine(Arc::new(StubEngine {
                engine_type: "text_engine",
                formats: vec!["gguf"],
                architectures: None,
                capabilities: vec![Capability::Text],
            }))
            .await
            .unwrap();
        registry
            .register_engine(Arc::new(StubEngine {
                engine_type: "embed_engine",
                formats: vec!["gguf"],
                architectures: None,
                capabilities: vec![Capability::Embeddings],
            }))
            .await
            .unwrap();

        let desc = descriptor("gguf", None);
        let text_engine = registry.resolve_engine(&desc, Capability::Text).await.unwrap();
        assert_eq!(text_engine.engine_type(), "text_engine");
        let embed_engine = registry.resolve_engine(&desc, Capability::Embeddings).await.unwrap();
        assert_eq!(embed_engine.engine_type(), "embed_engine");
    }

    #[tokio::test]
    async fn test_resolve_engine_architecture_reject() {
        let registry = EngineRegistry::new(60, 1000);
        registry
            .register_engine(Arc::new(StubEngine {
                engine_type: "generic_text",
                formats: vec!["safetensors"],
                architectures: Some(vec!["llama".to_string()]),
                capabilities: vec![Capability::Text],
            }))
            .await
            .unwrap();

        let desc = descriptor("safetensors", Some("GptOssForCausalLM"));
        assert!(registry.resolve_engine(&desc, Capability::Text).await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_engine_tie_break_lexicographic() {
        let registry = EngineRegistry::new(60, 1000);
        registry
            .register_engine(Arc::new(StubEngine {
                engine_type: "zeta",
                formats: vec!["gguf"],
                architectures: None,
                capabilities: vec![Capability::Text],
            }))
            .await
            .unwrap();
        registry
            .register_engine(Arc::new(StubEngine {
                engine_type: "alpha",
                formats: vec!["gguf"],
                architectures: None,
                capabilities: vec![Capability::Text],
            }))
            .await
            .unwrap();

        let desc = descriptor("gguf", None);
        let resolved = registry.resolve_engine(&desc, Capability::Text).await.unwrap();
        assert_eq!(resolved.engine_type(), "alpha");
    }

    #[tokio::test]
    async fn test_resolve_engine_runtime_hint_beats_lexicographic_tie_break() {
        let registry = EngineRegistry::new(60, 1000);
        registry
            .register_engine(Arc::new(StubEngine {
                engine_type: "zeta",
                formats: vec!["gguf"],
                architectures: None,
                capabilities: vec![Capability::Text],
            }))
            .await
            .unwrap();
        registry
            .register_engine(Arc::new(StubEngine {
                engine_type: "alpha",
                formats: vec!["gguf"],
                architectures: None,
                capabilities: vec![Capability::Text],
            }))
            .await
            .unwrap();

        let mut desc = descriptor("gguf", None);
        desc.runtime = Some("zeta".to_string());
        let resolved = registry.resolve_engine(&desc, Capability::Text).await.unwrap();
        assert_eq!(resolved.engine_type(), "zeta");
    }

    #[tokio::test]
    async fn test_load_plugins_missing_dir_is_noop() {
        let registry = EngineRegistry::new(60, 1000);
        let count = registry.load_plugins(Path::new("/nonexistent/plugins")).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_plugins_due_for_restart_empty_when_not_idle() {
        let registry = EngineRegistry::new(60, 1000);
        assert!(registry.plugins_due_for_restart(false).await.is_empty());
    }
}
