//! Model Resolver: unifies Model Storage, router-provided shared paths, and
//! Model Sync behind one `resolve(name)` call for the Inference Engine.

use std::sync::Arc;

use node_protocol::ModelDescriptor;

use crate::error::Result;
use crate::storage::ModelStorage;
use crate::sync::ModelSync;

/// Reports sync progress as the resolver pulls a missing model from the
/// router on demand. The dashboard/status surface this would feed is out of
/// scope; this trait is the documented seam for it.
pub trait SyncEventReporter: Send + Sync {
    fn on_sync_started(&self, model: &str);
    fn on_sync_progress(&self, model: &str, downloaded_bytes: u64, total_bytes: u64);
    fn on_sync_finished(&self, model: &str, result: &Result<()>);
}

/// A reporter that drops every event, for standalone-mode nodes with no
/// status surface to feed.
pub struct NullSyncEventReporter;

impl SyncEventReporter for NullSyncEventReporter {
    fn on_sync_started(&self, _model: &str) {}
    fn on_sync_progress(&self, _model: &str, _downloaded_bytes: u64, _total_bytes: u64) {}
    fn on_sync_finished(&self, _model: &str, _result: &Result<()>) {}
}

pub struct ModelResolver {
    storage: Arc<ModelStorage>,
    sync: Option<Arc<ModelSync>>,
    reporter: Arc<dyn SyncEventReporter>,
}

impl ModelResolver {
    pub fn new(storage: Arc<ModelStorage>, sync: Option<Arc<ModelSync>>, reporter: Arc<dyn SyncEventReporter>) -> Self {
        Self { storage, sync, reporter }
    }

    /// Resolves a model name to a descriptor: if it's already present
    /// locally (or in the router's shared-path mirror), return it; if not
    /// and a router sync is configured, pull it on demand before resolving
    /// again.
    pub async fn resolve(&self, name: &str) -> Result<Option<ModelDescriptor>> {
        if let Some(descriptor) = self.storage.resolve_descriptor(name).await? {
            return Ok(Some(descriptor));
        }

        let Some(sync) = &self.sync else { return Ok(None) };

        self.reporter.on_sync_started(name);
        let result = sync.fetch_model(name, self.reporter.as_ref()).await;
        self.reporter.on_sync_finished(name, &result);
        result?;

        self.storage.resolve_descriptor(name).await
    }

    pub async fn list_available(&self) -> Result<Vec<ModelDescriptor>> {
        self.storage.list_available_descriptors().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_resolve_returns_none_without_sync_when_absent() {
        let tmp = TempDir::new().unwrap();
        let storage = Arc::new(ModelStorage::new(tmp.path()));
        let resolver = ModelResolver::new(storage, None, Arc::new(NullSyncEventReporter));
        assert!(resolver.resolve("missing/model").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_finds_locally_present_model() {
        let tmp = TempDir::new().unwrap();
        let model_dir = tmp.path().join("a/b");
        tokio::fs::create_dir_all(&model_dir).await.unwrap();
        tokio::fs::write(model_dir.join("model.gguf"), b"x").await.unwrap();

        let storage = Arc::new(ModelStorage::new(tmp.path()));
        let resolver = ModelResolver::new(storage, None, Arc::new(NullSyncEventReporter));
        let descriptor = resolver.resolve("a/b").await.unwrap();
        assert!(descriptor.is_some());
    }
}
