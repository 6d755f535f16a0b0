//! Resource Monitor: periodic host/VRAM watermark sampling, with a
//! test-injectable usage provider so admission logic doesn't need real
//! hardware to exercise.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sysinfo::System;
use tokio::sync::RwLock;

/// A snapshot of resource usage at one point in time.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSnapshot {
    pub vram_total_gb: f32,
    pub vram_used_gb: f32,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
}

/// Source of resource usage readings. The default implementation samples
/// `sysinfo`; tests substitute a fixed-value stub (mirrors
/// `setResourceUsageProviderForTest`).
#[async_trait]
pub trait ResourceUsageProvider: Send + Sync {
    async fn snapshot(&self) -> ResourceSnapshot;
}

/// Host-memory-only provider (no GPU probing, per non-goals). `vram_*`
/// fields are left at zero unless a `max_vram_gb` ceiling is configured
/// upstream, in which case the caller treats that ceiling as the total and
/// tracks used VRAM itself via loaded-model accounting.
pub struct SystemResourceProvider {
    system: RwLock<System>,
}

impl SystemResourceProvider {
    pub fn new() -> Self {
        Self { system: RwLock::new(System::new_all()) }
    }
}

impl Default for SystemResourceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceUsageProvider for SystemResourceProvider {
    async fn snapshot(&self) -> ResourceSnapshot {
        let mut system = self.system.write().await;
        system.refresh_memory();
        ResourceSnapshot {
            vram_total_gb: 0.0,
            vram_used_gb: 0.0,
            memory_total_bytes: system.total_memory(),
            memory_used_bytes: system.used_memory(),
        }
    }
}

/// Periodic sampler that logs watermark crossings. Eviction itself is the
/// model manager's job; the monitor's tick only decides *whether* an
/// eviction pass is warranted and bounds how many evictions happen per tick
/// so a single slow tick can't cascade into unloading everything.
pub struct ResourceMonitor {
    provider: Arc<dyn ResourceUsageProvider>,
    high_watermark: f32,
    sample_interval: Duration,
    max_evictions_per_tick: usize,
}

impl ResourceMonitor {
    pub fn new(provider: Arc<dyn ResourceUsageProvider>, high_watermark: f32, sample_interval_secs: u64) -> Self {
        Self {
            provider,
            high_watermark,
            sample_interval: Duration::from_secs(sample_interval_secs),
            max_evictions_per_tick: 1,
        }
    }

    pub async fn snapshot(&self) -> ResourceSnapshot {
        self.provider.snapshot().await
    }

    pub fn is_over_watermark(&self, snapshot: &ResourceSnapshot) -> bool {
        if snapshot.memory_total_bytes > 0 {
            let ratio = snapshot.memory_used_bytes as f32 / snapshot.memory_total_bytes as f32;
            if ratio >= self.high_watermark {
                return true;
            }
        }
        if snapshot.vram_total_gb > 0.0 {
            let ratio = snapshot.vram_used_gb / snapshot.vram_total_gb;
            if ratio >= self.high_watermark {
                return true;
            }
        }
        false
    }

    /// Runs the sampling loop forever, calling `on_over_watermark` (bounded
    /// to `max_evictions_per_tick` eviction attempts) whenever the watermark
    /// is crossed. Intended to be spawned as a background task.
    pub async fn run<F, Fut>(&self, mut on_over_watermark: F)
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.sample_interval);
        loop {
            interval.tick().await;
            let snapshot = self.snapshot().await;
            tracing::debug!(
                "resource sample: mem {}/{} bytes, vram {:.1}/{:.1} GB",
                snapshot.memory_used_bytes,
                snapshot.memory_total_bytes,
                snapshot.vram_used_gb,
                snapshot.vram_total_gb
            );
            if self.is_over_watermark(&snapshot) {
                tracing::info!("resource watermark exceeded, requesting eviction pass");
                on_over_watermark(self.max_evictions_per_tick).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider(ResourceSnapshot);

    #[async_trait]
    impl ResourceUsageProvider for FixedProvider {
        async fn snapshot(&self) -> ResourceSnapshot {
            self.0
        }
    }

    #[tokio::test]
    async fn test_is_over_watermark_memory() {
        let provider = Arc::new(FixedProvider(ResourceSnapshot {
            vram_total_gb: 0.0,
            vram_used_gb: 0.0,
            memory_total_bytes: 1000,
            memory_used_bytes: 950,
        }));
        let monitor = ResourceMonitor::new(provider.clone(), 0.9, 5);
        let snapshot = monitor.snapshot().await;
        assert!(monitor.is_over_watermark(&snapshot));
    }

    #[tokio::test]
    async fn test_is_over_watermark_vram() {
        let provider = Arc::new(FixedProvider(ResourceSnapshot {
            vram_total_gb: 10.0,
            vram_used_gb: 9.5,
            memory_total_bytes: 0,
            memory_used_bytes: 0,
        }));
        let monitor = ResourceMonitor::new(provider, 0.9, 5);
        let snapshot = monitor.snapshot().await;
        assert!(monitor.is_over_watermark(&snapshot));
    }

    #[tokio::test]
    async fn test_under_watermark() {
        let provider = Arc::new(FixedProvider(ResourceSnapshot {
            vram_total_gb: 10.0,
            vram_used_gb: 1.0,
            memory_total_bytes: 1000,
            memory_used_bytes: 100,
        }));
        let monitor = ResourceMonitor::new(provider, 0.9, 5);
        let snapshot = monitor.snapshot().await;
        assert!(!monitor.is_over_watermark(&snapshot));
    }
}
