//! Inference Engine façade: the single entry point HTTP handlers call,
//! orchestrating resolver → registry → manager → engine.

mod postprocess;

pub use postprocess::{apply_stop_sequences, post_process_generated_text};

use std::sync::Arc;

use node_protocol::{Capability, ChatCompletionRequest, ChatCompletionResponse, ChatMessage};

use crate::error::{Error, Result};
use crate::model::ModelManager;
use crate::resolver::ModelResolver;

/// The façade handlers call into. Wraps resolver → manager → engine, and
/// applies output post-processing (gpt-oss harmony extraction, stop
/// sequences) that's uniform across engines.
pub struct InferenceEngine {
    resolver: Arc<ModelResolver>,
    manager: Arc<ModelManager>,
}

impl InferenceEngine {
    pub fn new(resolver: Arc<ModelResolver>, manager: Arc<ModelManager>) -> Self {
        Self { resolver, manager }
    }

    pub async fn load_model(&self, name: &str, capability: Capability) -> Result<()> {
        let descriptor = self
            .resolver
            .resolve(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("model not found: {}", name)))?;

        if !descriptor.capabilities.contains(&capability) && !descriptor.capabilities.is_empty() {
            // Fall through: registry resolution is still the authority on
            // capability support for formats whose descriptor predates a
            // capability tag (e.g. sync-provided manifests).
        }

        self.manager.ensure_loaded(&descriptor, capability).await
    }

    pub async fn generate_chat(
        &self,
        model_name: &str,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse> {
        let descriptor = self
            .resolver
            .resolve(model_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("model not found: {}", model_name)))?;

        let handle = self.manager.acquire(&descriptor, Capability::Text).await?;
        let is_gptoss = descriptor.architecture.as_deref() == Some("GptOssForCausalLM");

        let result = handle.engine().generate_chat(&descriptor.name, request).await;
        drop(handle);

        let mut response = result?;
        for choice in &mut response.choices {
            let Some(text) = choice.message.content_as_text() else { continue };
            let processed = post_process_generated_text(&text, is_gptoss);
            let truncated = match &request.stop {
                Some(stop) => apply_stop_sequences(&processed, &stop.as_slice()),
                None => processed,
            };
            choice.message = ChatMessage::text(choice.message.role.clone(), truncated);
        }

        Ok(response)
    }

    pub async fn generate_embeddings(&self, model_name: &str, input: &[&str]) -> Result<Vec<Vec<f32>>> {
        let descriptor = self
            .resolver
            .resolve(model_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("model not found: {}", model_name)))?;

        let handle = self.manager.acquire(&descriptor, Capability::Embeddings).await?;
        handle.engine().generate_embeddings(&descriptor.name, input).await
    }

    pub async fn generate_completion(&self, model_name: &str, prompt: &str) -> Result<String> {
        let descriptor = self
            .resolver
            .resolve(model_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("model not found: {}", model_name)))?;

        let handle = self.manager.acquire(&descriptor, Capability::Text).await?;
        let is_gptoss = descriptor.architecture.as_deref() == Some("GptOssForCausalLM");
        let request = ChatCompletionRequest {
            messages: vec![ChatMessage::text("user".to_string(), prompt.to_string())],
            tools: None,
            model: Some(descriptor.name.clone()),
            temperature: None,
            top_p: None,
            top_k: None,
            repeat_penalty: None,
            max_tokens: None,
            n: None,
            stop: None,
            presence_penalty: None,
            frequency_penalty: None,
            seed: None,
            logprobs: None,
            top_logprobs: None,
            stream: None,
        };
        let response = handle.engine().generate_chat(&descriptor.name, &request).await?;
        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content_as_text())
            .unwrap_or_default();
        Ok(post_process_generated_text(&text, is_gptoss))
    }

    pub async fn transcribe(&self, model_name: &str, audio: &[u8]) -> Result<String> {
        let descriptor = self
            .resolver
            .resolve(model_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("model not found: {}", model_name)))?;

        let handle = self.manager.acquire(&descriptor, Capability::AudioAsr).await?;
        handle.engine().transcribe(&descriptor.name, audio).await
    }

    pub async fn synthesize_speech(&self, model_name: &str, text: &str) -> Result<Vec<u8>> {
        let descriptor = self
            .resolver
            .resolve(model_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("model not found: {}", model_name)))?;

        let handle = self.manager.acquire(&descriptor, Capability::AudioTts).await?;
        handle.engine().synthesize_speech(&descriptor.name, text).await
    }

    pub async fn generate_images(&self, model_name: &str, prompt: &str, n: u32) -> Result<Vec<Vec<u8>>> {
        let descriptor = self
            .resolver
            .resolve(model_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("model not found: {}", model_name)))?;

        let handle = self.manager.acquire(&descriptor, Capability::Image).await?;
        handle.engine().generate_images(&descriptor.name, prompt, n).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_process_and_stop_sequences_are_reexported() {
        let text = apply_stop_sequences("hello world", &["world"]);
        assert_eq!(text, "hello ");
        let harmony = post_process_generated_text(
            "<|start|>assistant<|channel|>final<|message|>hi<|end|>",
            true,
        );
        assert_eq!(harmony, "hi");
    }
}
