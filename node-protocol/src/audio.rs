//! `/v1/audio/transcriptions` and `/v1/audio/speech` types.
//!
//! Transcription requests arrive as multipart form data (the audio file plus
//! form fields), so the request side is handled directly by the admission
//! layer's multipart extractor; this module covers the parsed-out parameters
//! and the JSON response shapes.

use serde::{Deserialize, Serialize};

/// Parameters extracted from a transcription multipart request.
#[derive(Debug, Clone, Default)]
pub struct TranscriptionParams {
    pub model: String,
    pub language: Option<String>,
    pub prompt: Option<String>,
    pub response_format: Option<String>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<TranscriptionSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    pub id: u32,
    pub start: f32,
    pub end: f32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub model: String,
    pub input: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub speed: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcription_response_minimal() {
        let resp = TranscriptionResponse {
            text: "hello world".to_string(),
            language: None,
            duration: None,
            segments: vec![],
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(json, r#"{"text":"hello world"}"#);
    }

    #[test]
    fn test_speech_request_defaults() {
        let json = r#"{"model": "tts-1", "input": "hi"}"#;
        let req: SpeechRequest = serde_json::from_str(json).unwrap();
        assert!(req.voice.is_none());
        assert!(req.response_format.is_none());
    }
}
