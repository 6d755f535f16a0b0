//! Model listing and lifecycle: `/v1/models` (OpenAI) and the
//! Ollama-compatible `/api/tags`, `/api/ps`, `/api/show`, `/api/models/pull`.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use node_protocol::model::{PsEntry, PsResponse, PullRequest, PullStatus, ShowResponse, TagEntry, TagsResponse};
use node_protocol::{Capability, ModelsResponse};
use serde_json::json;

use crate::error::Error;
use crate::state::AppState;
use crate::storage::ModelStorage;

pub fn v1_router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/models", get(list_models))
}

pub fn ollama_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tags", get(tags))
        .route("/api/ps", get(ps))
        .route("/api/show", post(show))
        .route("/api/models/pull", post(pull))
}

async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    match state.resolver.list_available().await {
        Ok(descriptors) => {
            let data = descriptors.into_iter().map(Into::into).collect();
            Json(ModelsResponse { object: "list".to_string(), data }).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Lists locally-synced models plus, if configured, a read-only mirror of an
/// Ollama model tree. Mirrored tags never participate in resolution; they're
/// surfaced here only so `ollama list`-style tooling sees the full picture.
async fn tags(State(state): State<Arc<AppState>>) -> Response {
    let mut models = match state.resolver.list_available().await {
        Ok(descriptors) => descriptors
            .into_iter()
            .map(|d| TagEntry { name: d.name, size: d.size_bytes, modified_at: d.modified_at })
            .collect::<Vec<_>>(),
        Err(e) => return e.into_response(),
    };

    if let Some(mirror_dir) = &state.config.storage.mirror_dir {
        let mirrored = ModelStorage::list_mirrored_tags(std::path::Path::new(mirror_dir)).await;
        models.extend(mirrored.into_iter().map(|(name, size)| TagEntry { name, size, modified_at: None }));
    }

    Json(TagsResponse { models }).into_response()
}

async fn ps(State(state): State<Arc<AppState>>) -> Response {
    let loaded = state.model_manager.loaded_snapshot().await;
    let mut models = Vec::with_capacity(loaded.len());
    for entry in loaded {
        let capability = state
            .resolver
            .resolve(&entry.name)
            .await
            .ok()
            .flatten()
            .and_then(|d| d.capabilities.into_iter().next())
            .unwrap_or(Capability::Text);
        models.push(PsEntry {
            name: entry.name,
            capability,
            size_vram: Some((entry.memory_gb * 1024.0 * 1024.0 * 1024.0) as u64),
            expires_at: None,
        });
    }
    Json(PsResponse { models }).into_response()
}

#[derive(serde::Deserialize)]
struct ShowRequest {
    name: String,
}

async fn show(State(state): State<Arc<AppState>>, Json(request): Json<ShowRequest>) -> Response {
    match state.resolver.resolve(&request.name).await {
        Ok(Some(descriptor)) => Json(ShowResponse {
            name: descriptor.name,
            format: descriptor.format,
            architecture: descriptor.architecture,
            capabilities: descriptor.capabilities,
            parameters: descriptor.quantization.map(|q| json!({ "quantization": q })),
        })
        .into_response(),
        Ok(None) => Error::NotFound(format!("model not found: {}", request.name)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn pull(State(state): State<Arc<AppState>>, Json(request): Json<PullRequest>) -> Response {
    match state.resolver.resolve(&request.name).await {
        Ok(Some(_)) => Json(PullStatus { status: "success".to_string(), downloaded_bytes: None, total_bytes: None })
            .into_response(),
        Ok(None) => Error::NotFound(format!("model not found: {}", request.name)).into_response(),
        Err(e) => e.into_response(),
    }
}
