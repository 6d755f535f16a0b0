//! `POST /v1/audio/transcriptions` (multipart) and `POST /v1/audio/speech`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Multipart, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use node_protocol::audio::{SpeechRequest, TranscriptionParams, TranscriptionResponse};

use crate::error::Error;
use crate::state::{require_ready, AppState, RequestGuard};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/audio/transcriptions", post(transcriptions))
        .route("/v1/audio/speech", post(speech))
}

async fn parse_transcription_multipart(mut multipart: Multipart) -> Result<(TranscriptionParams, Bytes), Response> {
    let mut params = TranscriptionParams::default();
    let mut audio: Option<Bytes> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(Error::InvalidArgument(e.to_string()).into_response()),
        };
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                audio = Some(field.bytes().await.map_err(|e| Error::InvalidArgument(e.to_string()).into_response())?);
            }
            "model" => {
                params.model = field.text().await.map_err(|e| Error::InvalidArgument(e.to_string()).into_response())?;
            }
            "language" => {
                params.language =
                    Some(field.text().await.map_err(|e| Error::InvalidArgument(e.to_string()).into_response())?);
            }
            "prompt" => {
                params.prompt =
                    Some(field.text().await.map_err(|e| Error::InvalidArgument(e.to_string()).into_response())?);
            }
            "response_format" => {
                params.response_format =
                    Some(field.text().await.map_err(|e| Error::InvalidArgument(e.to_string()).into_response())?);
            }
            "temperature" => {
                let text = field.text().await.map_err(|e| Error::InvalidArgument(e.to_string()).into_response())?;
                params.temperature = text.parse().ok();
            }
            _ => {}
        }
    }

    let audio = audio.ok_or_else(|| Error::InvalidArgument("file field is required".to_string()).into_response())?;
    if params.model.is_empty() {
        return Err(Error::InvalidArgument("model is required".to_string()).into_response());
    }

    Ok((params, audio))
}

async fn transcriptions(State(state): State<Arc<AppState>>, multipart: Multipart) -> Response {
    let _guard = match RequestGuard::try_acquire(&state) {
        Ok(guard) => guard,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_ready(&state) {
        return resp;
    }

    let (params, audio) = match parse_transcription_multipart(multipart).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match state.inference.transcribe(&params.model, &audio).await {
        Ok(text) => match params.response_format.as_deref() {
            Some("text") => text.into_response(),
            _ => Json(TranscriptionResponse { text, language: params.language, duration: None, segments: vec![] })
                .into_response(),
        },
        Err(e) => e.into_response(),
    }
}

async fn speech(State(state): State<Arc<AppState>>, Json(request): Json<SpeechRequest>) -> Response {
    let _guard = match RequestGuard::try_acquire(&state) {
        Ok(guard) => guard,
        Err(resp) => return resp,
    };
    if let Err(resp) = require_ready(&state) {
        return resp;
    }
    if request.input.is_empty() {
        return Error::InvalidArgument("input must not be empty".to_string()).into_response();
    }

    match state.inference.synthesize_speech(&request.model, &request.input).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "audio/mpeg")], bytes).into_response(),
        Err(e) => e.into_response(),
    }
}
