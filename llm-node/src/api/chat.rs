//! `POST /v1/chat/completions`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use node_protocol::{ChatCompletionChunk, ChatCompletionRequest};

use super::validation::validate_chat_request;
use crate::state::{require_ready, AppState, RequestGuard};

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/chat/completions", post(chat_completions))
}

async fn chat_completions(State(state): State<Arc<AppState>>, Json(request): Json<ChatCompletionRequest>) -> Response {
    let _guard = match RequestGuard::try_acquire(&state) {
        Ok(guard) => guard,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_ready(&state) {
        return resp;
    }
    if let Err(e) = validate_chat_request(&request) {
        return e.into_response();
    }

    let Some(model) = request.model.clone() else {
        return crate::error::Error::InvalidArgument("model is required".to_string()).into_response();
    };

    if request.stream == Some(true) {
        return stream_completion(state, model, request).await;
    }

    match state.inference.generate_chat(&model, &request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Emits the whole completion as a single-chunk SSE stream. The engines
/// behind this façade aren't token-streaming capable today, so this
/// satisfies clients expecting `stream: true` framing without pretending to
/// deliver incremental tokens.
async fn stream_completion(state: Arc<AppState>, model: String, request: ChatCompletionRequest) -> Response {
    let result = state.inference.generate_chat(&model, &request).await;
    let response = match result {
        Ok(response) => response,
        Err(e) => return e.into_response(),
    };

    let created = response.created;
    let id = response.id.clone();
    let model_name = response.model.clone();

    let mut events = Vec::new();
    for choice in &response.choices {
        let text = choice.message.content_as_text().unwrap_or_default();
        let chunk = ChatCompletionChunk {
            id: id.clone(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model_name.clone(),
            choices: vec![node_protocol::chat::ChunkChoice {
                index: choice.index,
                delta: node_protocol::chat::ChunkDelta {
                    role: Some("assistant".to_string()),
                    content: Some(text),
                    tool_calls: None,
                },
                finish_reason: choice.finish_reason.clone(),
            }],
        };
        events.push(Ok::<_, Infallible>(
            Event::default().data(serde_json::to_string(&chunk).unwrap_or_default()),
        ));
    }
    events.push(Ok(Event::default().data("[DONE]")));

    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(stream::iter(events));

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}
