//! Legacy `/v1/completions` types, kept alongside chat completions because
//! some clients (and embedding-adjacent tooling) still target it.

use serde::{Deserialize, Serialize};

use crate::chat::StopSequences;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: PromptInput,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub stop: Option<StopSequences>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub echo: Option<bool>,
    #[serde(default)]
    pub seed: Option<i64>,
}

/// `prompt` accepts a single string or a batch of strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    Single(String),
    Batch(Vec<String>),
}

impl PromptInput {
    pub fn as_vec(&self) -> Vec<&str> {
        match self {
            PromptInput::Single(s) => vec![s.as_str()],
            PromptInput::Batch(v) => v.iter().map(|s| s.as_str()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<crate::chat::Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub text: String,
    pub finish_reason: Option<String>,
}

impl CompletionResponse {
    pub fn new(model: String, text: String, finish_reason: Option<String>) -> Self {
        Self {
            id: format!("cmpl-{}", uuid::Uuid::new_v4()),
            object: "text_completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model,
            choices: vec![CompletionChoice {
                index: 0,
                text,
                finish_reason,
            }],
            usage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_input_single() {
        let prompt: PromptInput = serde_json::from_str(r#""Once upon a time""#).unwrap();
        assert_eq!(prompt.as_vec(), vec!["Once upon a time"]);
    }

    #[test]
    fn test_prompt_input_batch() {
        let prompt: PromptInput = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        assert_eq!(prompt.as_vec(), vec!["a", "b"]);
    }

    #[test]
    fn test_completion_response_new() {
        let resp = CompletionResponse::new("model".to_string(), "hi".to_string(), Some("stop".to_string()));
        assert!(resp.id.starts_with("cmpl-"));
        assert_eq!(resp.choices[0].text, "hi");
    }
}
