//! Model Manager: owns every loaded model, admits loads against the VRAM
//! and memory budget, evicts by LRU, and unloads models idle past their
//! timeout.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use node_protocol::{Capability, ModelDescriptor};
use tokio::sync::{Mutex, RwLock};

use crate::engine::{Engine, EngineRegistry};
use crate::error::{Error, Result};
use crate::resource::ResourceMonitor;

struct LoadedModel {
    engine: Arc<dyn Engine>,
    memory_gb: f32,
    size_bytes: u64,
    last_used: Instant,
    in_flight: AtomicU32,
}

pub struct ModelManagerConfig {
    pub max_vram_gb: Option<f32>,
    pub max_memory_bytes: Option<u64>,
    pub idle_timeout_secs: u64,
    pub always_loaded: Vec<String>,
    pub max_loaded_models: usize,
}

pub struct ModelManager {
    registry: Arc<EngineRegistry>,
    monitor: Arc<ResourceMonitor>,
    config: ModelManagerConfig,
    loaded: RwLock<HashMap<String, LoadedModel>>,
    load_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Models whose `unload_model` caller asked to unload while requests
    /// were still in flight. `release` checks this once `in_flight` hits
    /// zero and performs the deferred unload then.
    pending_unload: RwLock<HashSet<String>>,
}

/// A scoped borrow of a loaded model. Decrements the manager's in-flight
/// counter for this model on drop, so a pending eviction blocked on
/// in-flight requests can proceed once every handle is released.
pub struct ModelHandle {
    manager: Arc<ModelManager>,
    model_name: String,
    engine: Arc<dyn Engine>,
}

impl ModelHandle {
    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        let manager = self.manager.clone();
        let model_name = self.model_name.clone();
        tokio::spawn(async move {
            manager.release(&model_name).await;
        });
    }
}

impl ModelManager {
    pub fn new(registry: Arc<EngineRegistry>, monitor: Arc<ResourceMonitor>, config: ModelManagerConfig) -> Self {
        Self {
            registry,
            monitor,
            config,
            loaded: RwLock::new(HashMap::new()),
            load_locks: Mutex::new(HashMap::new()),
            pending_unload: RwLock::new(HashSet::new()),
        }
    }

    async fn lock_for(&self, model_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.load_locks.lock().await;
        locks
            .entry(model_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ensures a model is loaded, via single-flight per-model locking so
    /// concurrent callers for the same model share one load attempt.
    pub async fn ensure_loaded(&self, descriptor: &ModelDescriptor, capability: Capability) -> Result<()> {
        if self.loaded.read().await.contains_key(&descriptor.name) {
            return Ok(());
        }

        let per_model_lock = self.lock_for(&descriptor.name).await;
        let _guard = per_model_lock.lock().await;

        if self.loaded.read().await.contains_key(&descriptor.name) {
            return Ok(());
        }

        let engine = self.registry.resolve_engine(descriptor, capability).await.ok_or_else(|| {
            Error::Unsupported(format!("no engine supports {} for {:?}", descriptor.name, capability))
        })?;

        if !engine.is_model_supported(descriptor) {
            return Err(Error::Unsupported(format!(
                "{} cannot load {}: descriptor failed final support check",
                engine.engine_type(),
                descriptor.name
            )));
        }

        let required_gb = engine.estimate_memory_gb(descriptor);
        self.admit(&descriptor.name, required_gb, descriptor.size_bytes).await?;

        engine.load_model(descriptor).await?;

        self.loaded.write().await.insert(
            descriptor.name.clone(),
            LoadedModel {
                engine,
                memory_gb: required_gb,
                size_bytes: descriptor.size_bytes,
                last_used: Instant::now(),
                in_flight: AtomicU32::new(0),
            },
        );

        tracing::info!("loaded {} ({:.2} GB)", descriptor.name, required_gb);
        Ok(())
    }

    /// Ensures the model is loaded and returns a handle that tracks it as
    /// in-flight until dropped.
    pub async fn acquire(self: &Arc<Self>, descriptor: &ModelDescriptor, capability: Capability) -> Result<ModelHandle> {
        self.ensure_loaded(descriptor, capability).await?;

        let loaded = self.loaded.read().await;
        let model = loaded
            .get(&descriptor.name)
            .ok_or_else(|| Error::Internal(format!("{} vanished right after load", descriptor.name)))?;
        model.in_flight.fetch_add(1, Ordering::Relaxed);

        Ok(ModelHandle {
            manager: self.clone(),
            model_name: descriptor.name.clone(),
            engine: model.engine.clone(),
        })
    }

    /// Checks the VRAM and memory budgets against what's already loaded,
    /// evicting LRU entries (excluding `model_name` and always-loaded
    /// models) until `required_gb`/`required_bytes` fits or nothing more
    /// can be freed.
    async fn admit(&self, model_name: &str, required_gb: f32, required_bytes: u64) -> Result<()> {
        if let Some(max_vram_gb) = self.config.max_vram_gb {
            loop {
                let used: f32 = self.loaded.read().await.values().map(|m| m.memory_gb).sum();
                if used + required_gb <= max_vram_gb {
                    break;
                }
                if !self.evict_one_lru(model_name).await {
                    return Err(Error::ResourceExhausted(format!(
                        "cannot admit {}: requires {:.2}GB VRAM, budget {:.2}GB exhausted",
                        model_name, required_gb, max_vram_gb
                    )));
                }
            }
        } else {
            let snapshot = self.monitor.snapshot().await;
            if snapshot.vram_total_gb > 0.0 {
                let used =
                    snapshot.vram_used_gb + self.loaded.read().await.values().map(|m| m.memory_gb).sum::<f32>();
                if used + required_gb > snapshot.vram_total_gb {
                    return Err(Error::ResourceExhausted(format!(
                        "cannot admit {}: requires {:.2}GB VRAM, only {:.2}GB available",
                        model_name,
                        required_gb,
                        snapshot.vram_total_gb - used
                    )));
                }
            }
        }

        if let Some(max_bytes) = self.config.max_memory_bytes {
            loop {
                let used: u64 = self.loaded.read().await.values().map(|m| m.size_bytes).sum();
                if used + required_bytes <= max_bytes {
                    break;
                }
                if !self.evict_one_lru(model_name).await {
                    return Err(Error::ResourceExhausted(format!(
                        "cannot admit {}: memory budget exceeded ({} + {} > {})",
                        model_name, used, required_bytes, max_bytes
                    )));
                }
            }
        }

        if self.config.max_loaded_models > 0 {
            loop {
                let count = self.loaded.read().await.len();
                if count < self.config.max_loaded_models {
                    break;
                }
                if !self.evict_one_lru(model_name).await {
                    return Err(Error::ResourceExhausted(format!(
                        "cannot admit {}: {} model(s) already loaded, limit is {}",
                        model_name, count, self.config.max_loaded_models
                    )));
                }
            }
        }

        Ok(())
    }

    async fn evict_one_lru(&self, exclude: &str) -> bool {
        let victim = {
            let loaded = self.loaded.read().await;
            let mut oldest: Option<(String, Instant)> = None;
            for (name, model) in loaded.iter() {
                if name == exclude || self.config.always_loaded.contains(name) {
                    continue;
                }
                if model.in_flight.load(Ordering::Relaxed) > 0 {
                    continue;
                }
                if oldest.as_ref().map_or(true, |(_, t)| model.last_used < *t) {
                    oldest = Some((name.clone(), model.last_used));
                }
            }
            oldest.map(|(name, _)| name)
        };

        match victim {
            Some(name) => {
                self.unload(&name).await;
                true
            }
            None => false,
        }
    }

    pub async fn unload(&self, model_name: &str) {
        let removed = self.loaded.write().await.remove(model_name);
        if let Some(model) = removed {
            if let Err(e) = model.engine.unload_model(model_name).await {
                tracing::warn!("unload failed for {}: {}", model_name, e);
            }
            tracing::info!("unloaded {}", model_name);
        }
        self.pending_unload.write().await.remove(model_name);
    }

    /// Public unload entry point. If the model has in-flight requests,
    /// defers the unload until the last one drains (checked in `release`)
    /// instead of unloading out from under them. Returns `false` if the
    /// model isn't currently loaded.
    pub async fn unload_model(&self, model_name: &str) -> bool {
        let in_flight = match self.loaded.read().await.get(model_name) {
            Some(model) => model.in_flight.load(Ordering::Relaxed),
            None => return false,
        };

        if in_flight == 0 {
            self.unload(model_name).await;
        } else {
            self.pending_unload.write().await.insert(model_name.to_string());
            tracing::info!(
                "deferring unload of {} until {} in-flight request(s) drain",
                model_name,
                in_flight
            );
        }
        true
    }

    async fn release(&self, model_name: &str) {
        let should_unload = {
            let loaded = self.loaded.read().await;
            match loaded.get(model_name) {
                Some(model) => {
                    let remaining = model.in_flight.fetch_sub(1, Ordering::Relaxed) - 1;
                    remaining == 0 && self.pending_unload.read().await.contains(model_name)
                }
                None => false,
            }
        };
        if should_unload {
            self.unload(model_name).await;
        }
    }

    /// Evicts the single LRU-oldest non-always-loaded model, for the
    /// resource monitor's over-watermark callback. Refuses while any
    /// request is in flight, since an over-watermark sample during a burst
    /// of active requests isn't evidence that any particular model is idle.
    pub async fn evict_lru_under_pressure(&self, active_request_count: u32) -> bool {
        if active_request_count > 0 {
            return false;
        }
        self.evict_one_lru("").await
    }

    /// Unloads any loaded model idle longer than `idle_timeout_secs`,
    /// skipping always-loaded models and ones with in-flight requests.
    pub async fn evict_idle(&self) {
        let idle_timeout = std::time::Duration::from_secs(self.config.idle_timeout_secs);
        let to_evict: Vec<String> = {
            let loaded = self.loaded.read().await;
            loaded
                .iter()
                .filter(|(name, model)| {
                    !self.config.always_loaded.contains(*name)
                        && model.in_flight.load(Ordering::Relaxed) == 0
                        && model.last_used.elapsed() > idle_timeout
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in to_evict {
            tracing::info!("idle-unloading {}", name);
            self.unload(&name).await;
        }
    }

    pub async fn loaded_models(&self) -> Vec<String> {
        self.loaded.read().await.keys().cloned().collect()
    }

    /// Snapshot of loaded models with their VRAM footprint, for the
    /// Ollama-compatible `/api/ps` surface.
    pub async fn loaded_snapshot(&self) -> Vec<LoadedModelInfo> {
        self.loaded
            .read()
            .await
            .iter()
            .map(|(name, model)| LoadedModelInfo { name: name.clone(), memory_gb: model.memory_gb })
            .collect()
    }
}

pub struct LoadedModelInfo {
    pub name: String,
    pub memory_gb: f32,
}
