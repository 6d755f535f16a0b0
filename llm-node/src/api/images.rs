//! `POST /v1/images/generations`.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use node_protocol::images::{ImageGenerationRequest, ImageResponse};

use crate::error::Error;
use crate::state::{require_ready, AppState, RequestGuard};

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/images/generations", post(generations))
}

async fn generations(State(state): State<Arc<AppState>>, Json(request): Json<ImageGenerationRequest>) -> Response {
    let _guard = match RequestGuard::try_acquire(&state) {
        Ok(guard) => guard,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_ready(&state) {
        return resp;
    }
    if request.prompt.is_empty() {
        return Error::InvalidArgument("prompt must not be empty".to_string()).into_response();
    }

    let n = request.n.unwrap_or(1);
    if n == 0 || n > 10 {
        return Error::InvalidArgument(format!("n must be between 1 and 10, got {}", n)).into_response();
    }

    let Some(model) = request.model.clone() else {
        return Error::InvalidArgument("model is required".to_string()).into_response();
    };

    match state.inference.generate_images(&model, &request.prompt, n).await {
        Ok(images) => {
            let encoded = images.into_iter().map(|bytes| BASE64.encode(bytes)).collect();
            Json(ImageResponse::from_b64(encoded)).into_response()
        }
        Err(e) => e.into_response(),
    }
}
