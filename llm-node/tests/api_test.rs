//! Integration tests for the llm-node HTTP API's wire types.
//!
//! `llm-node` ships as a binary only, so these tests exercise the shared
//! `node-protocol` types the API speaks over the wire rather than reaching
//! into the binary's private modules.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use tower::ServiceExt;

#[tokio::test]
async fn test_health_endpoint() {
    let app = Router::new().route("/health", axum::routing::get(health_handler));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

async fn health_handler() -> (StatusCode, axum::Json<serde_json::Value>) {
    (StatusCode::OK, axum::Json(serde_json::json!({"status": "ok"})))
}

#[test]
fn test_capability_serialization_roundtrip() {
    use node_protocol::Capability;

    for cap in Capability::ALL {
        let json = serde_json::to_string(&cap).unwrap();
        let parsed: Capability = serde_json::from_str(&json).unwrap();
        assert_eq!(cap, parsed);
    }
}

#[test]
fn test_chat_request_minimal() {
    use node_protocol::ChatCompletionRequest;

    let json = r#"{
        "model": "llama-3.1-8b",
        "messages": [
            {"role": "user", "content": "Hello"}
        ]
    }"#;

    let request: ChatCompletionRequest = serde_json::from_str(json).unwrap();
    assert_eq!(request.model, Some("llama-3.1-8b".to_string()));
    assert_eq!(request.messages.len(), 1);
    assert_eq!(request.messages[0].role, "user");
}

#[test]
fn test_chat_request_with_tools() {
    use node_protocol::ChatCompletionRequest;

    let json = r#"{
        "model": "llama-3.1-8b",
        "messages": [
            {"role": "user", "content": "What's the weather?"}
        ],
        "tools": [
            {
                "type": "function",
                "function": {
                    "name": "get_weather",
                    "parameters": {}
                }
            }
        ],
        "temperature": 0.7,
        "max_tokens": 100
    }"#;

    let request: ChatCompletionRequest = serde_json::from_str(json).unwrap();
    assert!(request.tools.is_some());
    assert_eq!(request.temperature, Some(0.7));
    assert_eq!(request.max_tokens, Some(100));
}

#[test]
fn test_completion_request_prompt_accepts_string_or_array() {
    use node_protocol::CompletionRequest;

    let single: CompletionRequest =
        serde_json::from_str(r#"{"model": "llama-3.1-8b", "prompt": "Once upon a time"}"#).unwrap();
    assert_eq!(single.prompt.as_vec(), vec!["Once upon a time"]);

    let batched: CompletionRequest =
        serde_json::from_str(r#"{"model": "llama-3.1-8b", "prompt": ["a", "b"]}"#).unwrap();
    assert_eq!(batched.prompt.as_vec(), vec!["a", "b"]);
}

#[test]
fn test_embeddings_request_input_accepts_string_or_array() {
    use node_protocol::EmbeddingsRequest;

    let json = r#"{"model": "bge-small", "input": ["hello", "world"]}"#;
    let request: EmbeddingsRequest = serde_json::from_str(json).unwrap();
    assert_eq!(request.input.as_vec().len(), 2);
}

#[test]
fn test_node_registration_response_roundtrip() {
    use node_protocol::router::NodeRegistrationResponse;

    let json = r#"{"node_token": "abc123"}"#;
    let parsed: NodeRegistrationResponse = serde_json::from_str(json).unwrap();
    assert_eq!(parsed.node_token, "abc123");
}

#[test]
fn test_image_generation_request_defaults() {
    use node_protocol::images::ImageGenerationRequest;

    let json = r#"{"model": "sdxl", "prompt": "a red fox in snow"}"#;
    let request: ImageGenerationRequest = serde_json::from_str(json).unwrap();
    assert_eq!(request.prompt, "a red fox in snow");
    assert!(request.n.is_none());
}
