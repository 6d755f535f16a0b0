//! Request validation shared across the OpenAI-compatible handlers.
//!
//! All of these return `Error::InvalidArgument`, which the façade maps to
//! HTTP 400, so handlers can just use `?` on them.

use node_protocol::chat::{ContentPart, MessageContent, StopSequences};
use node_protocol::completion::PromptInput;
use node_protocol::{ChatCompletionRequest, ChatMessage};

use crate::error::{Error, Result};

const MAX_IMAGES_PER_REQUEST: usize = 10;

fn in_range(name: &str, value: Option<f32>, min: f32, max: f32) -> Result<()> {
    if let Some(v) = value {
        if !(min..=max).contains(&v) {
            return Err(Error::InvalidArgument(format!(
                "{} must be between {} and {}, got {}",
                name, min, max, v
            )));
        }
    }
    Ok(())
}

fn in_range_u32(name: &str, value: Option<u32>, min: u32, max: u32) -> Result<()> {
    if let Some(v) = value {
        if v < min || v > max {
            return Err(Error::InvalidArgument(format!(
                "{} must be between {} and {}, got {}",
                name, min, max, v
            )));
        }
    }
    Ok(())
}

fn validate_stop(stop: &Option<StopSequences>) -> Result<()> {
    let Some(stop) = stop else { return Ok(()) };
    for s in stop.as_slice() {
        if s.is_empty() {
            return Err(Error::InvalidArgument("stop sequences must not be empty strings".to_string()));
        }
    }
    Ok(())
}

fn count_images(content: &MessageContent) -> usize {
    match content {
        MessageContent::Text(_) => 0,
        MessageContent::Parts(parts) => parts
            .iter()
            .filter(|p| matches!(p, ContentPart::ImageUrl { .. }))
            .count(),
    }
}

fn validate_message(message: &ChatMessage) -> Result<()> {
    if message.role.is_empty() {
        return Err(Error::InvalidArgument("message role must not be empty".to_string()));
    }
    Ok(())
}

/// Validates a chat completion request per the OpenAI-compatible surface:
/// non-empty messages with non-empty roles, sampling parameters within
/// range, at most 10 images across all messages, and the `logprobs` +
/// `stream` combination rejected since streamed choices carry no logprobs.
pub fn validate_chat_request(request: &ChatCompletionRequest) -> Result<()> {
    if request.messages.is_empty() {
        return Err(Error::InvalidArgument("messages must not be empty".to_string()));
    }

    let mut image_count = 0;
    for message in &request.messages {
        validate_message(message)?;
        if let Some(content) = &message.content {
            image_count += count_images(content);
        }
    }
    if image_count > MAX_IMAGES_PER_REQUEST {
        return Err(Error::InvalidArgument(format!(
            "at most {} images are allowed per request, got {}",
            MAX_IMAGES_PER_REQUEST, image_count
        )));
    }

    in_range("temperature", request.temperature, 0.0, 2.0)?;
    in_range("top_p", request.top_p, 0.0, 1.0)?;
    in_range_u32("top_k", request.top_k, 0, 1000)?;
    in_range("repeat_penalty", request.repeat_penalty, 0.0, 2.0)?;
    in_range_u32("n", request.n, 1, 8)?;
    in_range("presence_penalty", request.presence_penalty, -2.0, 2.0)?;
    in_range("frequency_penalty", request.frequency_penalty, -2.0, 2.0)?;
    in_range_u32("top_logprobs", request.top_logprobs, 0, 20)?;

    if request.logprobs == Some(true) && request.stream == Some(true) {
        return Err(Error::InvalidArgument(
            "logprobs is not supported together with stream".to_string(),
        ));
    }

    validate_stop(&request.stop)?;
    Ok(())
}

/// Validates a legacy completion request: non-empty prompt(s) and sampling
/// parameters within the same ranges as chat completions.
pub fn validate_completion_request(
    prompt: &PromptInput,
    temperature: Option<f32>,
    top_p: Option<f32>,
    n: Option<u32>,
    stop: &Option<StopSequences>,
) -> Result<()> {
    if prompt.as_vec().iter().any(|p| p.is_empty()) {
        return Err(Error::InvalidArgument("prompt must not be empty".to_string()));
    }
    in_range("temperature", temperature, 0.0, 2.0)?;
    in_range("top_p", top_p, 0.0, 1.0)?;
    in_range_u32("n", n, 1, 8)?;
    validate_stop(stop)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_protocol::ChatMessage;

    fn base_request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            messages: vec![ChatMessage::text("user".to_string(), "hi".to_string())],
            tools: None,
            model: Some("test-model".to_string()),
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
        }
    }

    #[test]
    fn test_empty_messages_rejected() {
        let mut request = base_request();
        request.messages.clear();
        assert!(validate_chat_request(&request).is_err());
    }

    #[test]
    fn test_temperature_out_of_range_rejected() {
        let mut request = base_request();
        request.temperature = Some(5.0);
        assert!(validate_chat_request(&request).is_err());
    }

    #[test]
    fn test_top_k_out_of_range_rejected() {
        let mut request = base_request();
        request.top_k = Some(5000);
        assert!(validate_chat_request(&request).is_err());
    }

    #[test]
    fn test_repeat_penalty_out_of_range_rejected() {
        let mut request = base_request();
        request.repeat_penalty = Some(3.0);
        assert!(validate_chat_request(&request).is_err());
    }

    #[test]
    fn test_logprobs_with_stream_rejected() {
        let mut request = base_request();
        request.logprobs = Some(true);
        request.stream = Some(true);
        assert!(validate_chat_request(&request).is_err());
    }

    #[test]
    fn test_valid_request_passes() {
        let request = base_request();
        assert!(validate_chat_request(&request).is_ok());
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let prompt = PromptInput::Single(String::new());
        assert!(validate_completion_request(&prompt, None, None, None, &None).is_err());
    }
}
