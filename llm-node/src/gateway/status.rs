//! Builds the `NodeHealthReport` sent to the router on every heartbeat, from
//! engine health, loaded models, and host resource telemetry.

use std::sync::Arc;

use node_protocol::router::{LoadedModels, NodeHealth, NodeHealthReport, NodeMetrics, SyncStatus};
use node_protocol::Capability;

use crate::engine::EngineRegistry;
use crate::model::ModelManager;
use crate::resolver::ModelResolver;
use crate::resource::ResourceMonitor;

pub struct StatusCollector {
    node_id: String,
    engine_registry: Arc<EngineRegistry>,
    model_manager: Arc<ModelManager>,
    resolver: Arc<ModelResolver>,
    resource_monitor: Arc<ResourceMonitor>,
}

impl StatusCollector {
    pub fn new(
        node_id: String,
        engine_registry: Arc<EngineRegistry>,
        model_manager: Arc<ModelManager>,
        resolver: Arc<ModelResolver>,
        resource_monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self { node_id, engine_registry, model_manager, resolver, resource_monitor }
    }

    pub async fn collect(&self, requests_in_flight: u32) -> NodeHealthReport {
        let engines = self.engine_registry.all().await;
        let mut healthy = 0usize;
        for engine in &engines {
            if engine.health_check().await.is_ok() {
                healthy += 1;
            }
        }

        let status = Self::compute_health(engines.len(), healthy);
        let loaded_models = self.collect_loaded_models().await;
        let metrics = self.collect_metrics(requests_in_flight).await;

        NodeHealthReport {
            node_id: self.node_id.clone(),
            status,
            loaded_models,
            sync_status: SyncStatus::default(),
            metrics: Some(metrics),
        }
    }

    async fn collect_loaded_models(&self) -> LoadedModels {
        let mut loaded = LoadedModels::default();
        for name in self.model_manager.loaded_models().await {
            let Ok(Some(descriptor)) = self.resolver.resolve(&name).await else { continue };
            for capability in &descriptor.capabilities {
                match capability {
                    Capability::Text => loaded.llm.push(name.clone()),
                    Capability::AudioAsr => loaded.asr.push(name.clone()),
                    Capability::AudioTts => loaded.tts.push(name.clone()),
                    Capability::Image | Capability::ImageUnderstanding => loaded.image_gen.push(name.clone()),
                    Capability::Embeddings => {}
                }
            }
        }
        loaded
    }

    async fn collect_metrics(&self, requests_in_flight: u32) -> NodeMetrics {
        let snapshot = self.resource_monitor.snapshot().await;
        NodeMetrics {
            requests_in_flight,
            memory_used_bytes: Some(snapshot.memory_used_bytes),
            memory_total_bytes: Some(snapshot.memory_total_bytes),
            gpu_memory_used_bytes: if snapshot.vram_total_gb > 0.0 {
                Some((snapshot.vram_used_gb * 1024.0 * 1024.0 * 1024.0) as u64)
            } else {
                None
            },
            gpu_memory_total_bytes: if snapshot.vram_total_gb > 0.0 {
                Some((snapshot.vram_total_gb * 1024.0 * 1024.0 * 1024.0) as u64)
            } else {
                None
            },
            cpu_usage_percent: None,
        }
    }

    fn compute_health(total: usize, healthy: usize) -> NodeHealth {
        if total == 0 {
            NodeHealth::Starting
        } else if healthy == total {
            NodeHealth::Healthy
        } else if healthy > 0 {
            NodeHealth::Degraded
        } else {
            NodeHealth::Unhealthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_health_all_healthy() {
        assert_eq!(StatusCollector::compute_health(2, 2), NodeHealth::Healthy);
    }

    #[test]
    fn test_compute_health_some_unhealthy() {
        assert_eq!(StatusCollector::compute_health(2, 1), NodeHealth::Degraded);
    }

    #[test]
    fn test_compute_health_all_unhealthy() {
        assert_eq!(StatusCollector::compute_health(2, 0), NodeHealth::Unhealthy);
    }

    #[test]
    fn test_compute_health_no_engines() {
        assert_eq!(StatusCollector::compute_health(0, 0), NodeHealth::Starting);
    }
}
