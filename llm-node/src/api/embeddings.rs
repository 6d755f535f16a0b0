//! `POST /v1/embeddings`.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use node_protocol::{EmbeddingsRequest, EmbeddingsResponse};

use crate::error::Error;
use crate::state::{require_ready, AppState, RequestGuard};

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/embeddings", post(embeddings))
}

async fn embeddings(State(state): State<Arc<AppState>>, Json(request): Json<EmbeddingsRequest>) -> Response {
    let _guard = match RequestGuard::try_acquire(&state) {
        Ok(guard) => guard,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_ready(&state) {
        return resp;
    }

    let input = request.input.as_vec();
    if input.is_empty() || input.iter().any(|s| s.is_empty()) {
        return Error::InvalidArgument("input must not be empty".to_string()).into_response();
    }

    let prompt_tokens: u32 = input.iter().map(|s| (s.split_whitespace().count()) as u32).sum();

    match state.inference.generate_embeddings(&request.model, &input).await {
        Ok(vectors) => Json(EmbeddingsResponse::new(request.model.clone(), vectors, prompt_tokens)).into_response(),
        Err(e) => e.into_response(),
    }
}
