//! Shared application state.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::Config;
use crate::engine::EngineRegistry;
use crate::error::{service_unavailable_response, too_many_requests_response};
use crate::inference::InferenceEngine;
use crate::model::ModelManager;
use crate::resolver::ModelResolver;
use crate::resource::ResourceMonitor;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub engine_registry: Arc<EngineRegistry>,
    pub model_manager: Arc<ModelManager>,
    pub resolver: Arc<ModelResolver>,
    pub resource_monitor: Arc<ResourceMonitor>,
    pub inference: Arc<InferenceEngine>,
    request_permits: Arc<Semaphore>,
    /// False until the initial router sync (or standalone startup) completes.
    /// `/v1/*` except `/v1/models` refuses requests while this is false.
    is_ready: AtomicBool,
    active_requests: AtomicU32,
}

impl AppState {
    pub fn new(
        config: Config,
        engine_registry: Arc<EngineRegistry>,
        model_manager: Arc<ModelManager>,
        resolver: Arc<ModelResolver>,
        resource_monitor: Arc<ResourceMonitor>,
        inference: Arc<InferenceEngine>,
    ) -> Self {
        let request_permits = Arc::new(Semaphore::new(config.api.max_concurrent_requests));
        Self {
            config,
            engine_registry,
            model_manager,
            resolver,
            resource_monitor,
            inference,
            request_permits,
            is_ready: AtomicBool::new(false),
            active_requests: AtomicU32::new(0),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.is_ready.store(ready, Ordering::Release);
    }

    pub fn active_request_count(&self) -> u32 {
        self.active_requests.load(Ordering::Relaxed)
    }
}

/// Scoped admission guard bumping `active_request_count` for the lifetime of
/// a request, backed by a semaphore that enforces `api.max_concurrent_requests`.
/// `try_acquire` fails (soft limit hit) rather than queuing, so callers get an
/// immediate 429 instead of piling up behind a slow backend.
pub struct RequestGuard<'a> {
    state: &'a AppState,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl<'a> RequestGuard<'a> {
    pub fn try_acquire(state: &'a AppState) -> std::result::Result<Self, axum::response::Response> {
        match state.request_permits.clone().try_acquire_owned() {
            Ok(permit) => {
                state.active_requests.fetch_add(1, Ordering::Relaxed);
                Ok(Self { state, _permit: permit })
            }
            Err(_) => Err(too_many_requests_response()),
        }
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.state.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Returns an error response if the node isn't ready yet. `/v1/models`
/// callers skip this check since listing what's available shouldn't require
/// the node to have finished its initial sync.
pub fn require_ready(state: &AppState) -> std::result::Result<(), axum::response::Response> {
    if state.is_ready() {
        Ok(())
    } else {
        Err(service_unavailable_response("Node is syncing models with router"))
    }
}
