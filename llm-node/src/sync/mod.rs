//! Model Sync: reconciles local storage against the router's catalog,
//! downloading missing models with ETag/size-cached conditional requests.

mod etag_cache;

pub use etag_cache::EtagCache;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use node_protocol::router::{ManifestFile, ModelCatalog, ModelManifestEntry};
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::resolver::SyncEventReporter;
use crate::storage::ModelStorage;

/// How many files within the same priority tier download concurrently.
/// Lower-priority tiers still download, just after every higher-priority
/// tier has finished, so a model's most important files (e.g. its index
/// or config) land first.
const MAX_CONCURRENT_DOWNLOADS_PER_TIER: usize = 4;

pub struct SyncDiff {
    pub to_download: Vec<String>,
    pub to_delete: Vec<String>,
}

pub struct ModelSync {
    router_url: String,
    auth_token: String,
    /// Token issued at registration, required as `X-Node-Token` on catalog
    /// and blob calls. Shared with the gateway client so a re-registration
    /// (after a token rotation) is picked up without restarting sync.
    node_token: Arc<RwLock<Option<String>>>,
    http_client: Client,
    storage: ModelStorage,
    models_dir: PathBuf,
    etag_cache: EtagCache,
}

impl ModelSync {
    pub fn new(router_url: String, auth_token: String, models_dir: PathBuf, request_timeout_ms: u64) -> Self {
        Self::with_node_token(router_url, auth_token, models_dir, request_timeout_ms, Arc::new(RwLock::new(None)))
    }

    pub fn with_node_token(
        router_url: String,
        auth_token: String,
        models_dir: PathBuf,
        request_timeout_ms: u64,
        node_token: Arc<RwLock<Option<String>>>,
    ) -> Self {
        let http_client = Client::builder()
            .connect_timeout(Duration::from_millis(request_timeout_ms))
            .timeout(Duration::from_millis(request_timeout_ms * 4))
            .build()
            .unwrap_or_default();

        let cache_path = models_dir.join(".sync-etags.json");
        Self {
            router_url,
            auth_token,
            node_token,
            http_client,
            storage: ModelStorage::new(models_dir.clone()),
            models_dir,
            etag_cache: EtagCache::new(cache_path),
        }
    }

    async fn fetch_catalog(&self) -> Result<ModelCatalog> {
        let url = format!("{}/v0/models", self.router_url);
        let mut request = self.http_client.get(&url).bearer_auth(&self.auth_token);
        if let Some(token) = self.node_token.read().await.as_ref() {
            request = request.header("X-Node-Token", token);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(Error::Unavailable(format!("router catalog request failed: {}", response.status())));
        }

        response.json::<ModelCatalog>().await.map_err(|e| Error::Internal(e.to_string()))
    }

    /// Diffs the router's catalog against local storage. Models present
    /// locally but absent from the catalog are reported in `to_delete`, not
    /// removed: deletion is operator policy.
    pub async fn diff(&self) -> Result<SyncDiff> {
        let catalog = self.fetch_catalog().await?;
        let local = self.storage.list_available_descriptors().await?;
        let local_names: std::collections::HashSet<String> = local.iter().map(|d| d.name.clone()).collect();
        let remote_names: std::collections::HashSet<String> =
            catalog.models.iter().map(|m| m.name.clone()).collect();

        let to_download = remote_names.difference(&local_names).cloned().collect();
        let to_delete = local_names.difference(&remote_names).cloned().collect();

        Ok(SyncDiff { to_download, to_delete })
    }

    /// Downloads every file of a single model's manifest entry, skipping
    /// files whose cached ETag+size still match. Files are grouped by
    /// `priority` (highest first); within a tier, up to
    /// `MAX_CONCURRENT_DOWNLOADS_PER_TIER` download concurrently, and each
    /// file's own `max_bps` (if set) throttles its transfer independently.
    pub async fn fetch_model(&self, name: &str, reporter: &dyn SyncEventReporter) -> Result<()> {
        let catalog = self.fetch_catalog().await?;
        let entry = catalog
            .models
            .into_iter()
            .find(|m| m.name == name)
            .ok_or_else(|| Error::NotFound(format!("model not in router catalog: {}", name)))?;

        let model_dir = self.storage.model_name_to_dir(name);
        tokio::fs::create_dir_all(&model_dir).await.map_err(Error::from)?;

        let total: u64 = entry.files.values().map(|f| f.size_bytes).sum();
        let mut downloaded = 0u64;

        let mut tiers: Vec<(u32, Vec<(String, ManifestFile)>)> = Vec::new();
        for (file_name, file) in &entry.files {
            match tiers.iter_mut().find(|(priority, _)| *priority == file.priority) {
                Some((_, files)) => files.push((file_name.clone(), file.clone())),
                None => tiers.push((file.priority, vec![(file_name.clone(), file.clone())])),
            }
        }
        tiers.sort_by(|a, b| b.0.cmp(&a.0));

        for (priority, files) in tiers {
            let concurrency = MAX_CONCURRENT_DOWNLOADS_PER_TIER.min(files.len().max(1));
            tracing::debug!(
                "downloading {} file(s) of {} at priority {} with concurrency {}",
                files.len(),
                name,
                priority,
                concurrency
            );

            let results: Vec<Result<u64>> = stream::iter(files.iter())
                .map(|(file_name, file)| async {
                    self.download_file(&entry, &model_dir, file_name, file).await?;
                    Ok(file.size_bytes)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

            for result in results {
                downloaded += result?;
                reporter.on_sync_progress(name, downloaded, total);
            }
        }

        Ok(())
    }

    async fn download_file(
        &self,
        entry: &ModelManifestEntry,
        model_dir: &std::path::Path,
        file_name: &str,
        file: &ManifestFile,
    ) -> Result<()> {
        let dest = model_dir.join(file_name);

        if let Ok(meta) = tokio::fs::metadata(&dest).await {
            if meta.len() == file.size_bytes {
                if let Some(cached_etag) = self.etag_cache.get(&entry.name, file_name).await {
                    if cached_etag == file.etag {
                        tracing::debug!("skipping {}/{}: size and etag unchanged", entry.name, file_name);
                        return Ok(());
                    }
                }
            }
        }

        let url = if let Some(shared_path) = &entry.shared_path {
            let shared = PathBuf::from(shared_path).join(file_name);
            if tokio::fs::try_exists(&shared).await.unwrap_or(false) {
                tokio::fs::copy(&shared, &dest).await.map_err(Error::from)?;
                self.etag_cache.set(&entry.name, file_name, &file.etag).await?;
                return Ok(());
            }
            format!("{}/v0/models/blob/{}/{}", self.router_url, entry.name, file_name)
        } else {
            format!("{}/v0/models/blob/{}/{}", self.router_url, entry.name, file_name)
        };

        let mut request = self.http_client.get(&url).bearer_auth(&self.auth_token);
        if let Some(cached_etag) = self.etag_cache.get(&entry.name, file_name).await {
            request = request.header("If-None-Match", cached_etag);
        }

        let response = request.send().await?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            tracing::debug!("304 for {}/{}, reusing cached file", entry.name, file_name);
            return Ok(());
        }

        if !response.status().is_success() {
            tracing::error!("download failed for {}/{}: {}", entry.name, file_name, response.status());
            return Err(Error::Unavailable(format!("download failed: {}", response.status())));
        }

        let written = match file.max_bps {
            Some(max_bps) => Self::write_rate_limited(response, &dest, max_bps).await?,
            None => {
                let bytes = response.bytes().await.map_err(|e| Error::Internal(e.to_string()))?;
                tokio::fs::write(&dest, &bytes).await.map_err(Error::from)?;
                bytes.len() as u64
            }
        };
        self.etag_cache.set(&entry.name, file_name, &file.etag).await?;

        tracing::info!("downloaded {}/{} ({} bytes)", entry.name, file_name, written);
        Ok(())
    }

    /// Streams the response body to `dest`, pacing writes so the average
    /// throughput stays at or below `max_bps` bytes/sec.
    async fn write_rate_limited(response: reqwest::Response, dest: &std::path::Path, max_bps: u64) -> Result<u64> {
        let mut file = tokio::fs::File::create(dest).await.map_err(Error::from)?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        let start = tokio::time::Instant::now();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Internal(e.to_string()))?;
            file.write_all(&chunk).await.map_err(Error::from)?;
            written += chunk.len() as u64;

            let expected_secs = written as f64 / max_bps.max(1) as f64;
            let elapsed_secs = start.elapsed().as_secs_f64();
            if expected_secs > elapsed_secs {
                tokio::time::sleep(Duration::from_secs_f64(expected_secs - elapsed_secs)).await;
            }
        }

        Ok(written)
    }
}
