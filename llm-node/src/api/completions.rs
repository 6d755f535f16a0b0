//! `POST /v1/completions` (legacy, non-chat).

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use node_protocol::completion::{CompletionChoice, CompletionRequest, CompletionResponse};

use super::validation::validate_completion_request;
use crate::inference::apply_stop_sequences;
use crate::state::{require_ready, AppState, RequestGuard};

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/completions", post(completions))
}

async fn completions(State(state): State<Arc<AppState>>, Json(request): Json<CompletionRequest>) -> Response {
    let _guard = match RequestGuard::try_acquire(&state) {
        Ok(guard) => guard,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_ready(&state) {
        return resp;
    }
    if let Err(e) =
        validate_completion_request(&request.prompt, request.temperature, request.top_p, request.n, &request.stop)
    {
        return e.into_response();
    }

    let prompts = request.prompt.as_vec();
    let mut choices = Vec::with_capacity(prompts.len());

    for (index, prompt) in prompts.iter().enumerate() {
        let generated = match state.inference.generate_completion(&request.model, prompt).await {
            Ok(text) => text,
            Err(e) => return e.into_response(),
        };
        let truncated = match &request.stop {
            Some(stop) => apply_stop_sequences(&generated, &stop.as_slice()),
            None => generated,
        };
        let text = if request.echo == Some(true) { format!("{}{}", prompt, truncated) } else { truncated };
        choices.push(CompletionChoice { index: index as u32, text, finish_reason: Some("stop".to_string()) });
    }

    let response = CompletionResponse {
        id: format!("cmpl-{}", uuid::Uuid::new_v4()),
        object: "text_completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: request.model.clone(),
        choices,
        usage: None,
    };

    Json(response).into_response()
}
