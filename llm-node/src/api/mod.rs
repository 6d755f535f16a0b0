//! OpenAI- and Ollama-compatible HTTP API.

pub mod audio;
pub mod chat;
pub mod completions;
pub mod embeddings;
pub mod health;
pub mod images;
pub mod models;
pub mod validation;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;

/// `/v1/*`: the OpenAI-compatible surface.
pub fn v1_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(chat::router())
        .merge(completions::router())
        .merge(embeddings::router())
        .merge(models::v1_router())
        .merge(audio::router())
        .merge(images::router())
}

/// `/api/*`: the Ollama-compatible surface, plus `/health`.
pub fn ollama_router() -> Router<Arc<AppState>> {
    models::ollama_router().route("/health", get(health::health))
}
