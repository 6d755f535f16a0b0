//! Pure text post-processing: gpt-oss harmony channel extraction and stop
//! sequence truncation. No I/O, no engine/manager dependencies, so these are
//! unit tested directly against the scenarios engine output must satisfy.

const CHANNEL_MARKER: &str = "<|channel|>final<|message|>";
const END_MARKER: &str = "<|end|>";

/// Extracts the "final" channel's message from gpt-oss harmony-formatted
/// output. Non-gpt-oss output passes through unchanged.
///
/// Harmony output looks like:
/// `<|start|>assistant<|channel|>analysis<|message|>...<|end|><|start|>assistant<|channel|>final<|message|>answer<|end|>`
///
/// Only the last `final` channel's message is kept; if the terminator is
/// missing (the generation was cut off mid-message), everything after the
/// marker is kept rather than truncating to empty.
pub fn post_process_generated_text(raw: &str, is_gptoss: bool) -> String {
    if !is_gptoss {
        return raw.to_string();
    }

    let Some(marker_pos) = raw.rfind(CHANNEL_MARKER) else {
        return raw.to_string();
    };

    let after_marker = &raw[marker_pos + CHANNEL_MARKER.len()..];
    match after_marker.find(END_MARKER) {
        Some(end_pos) => after_marker[..end_pos].to_string(),
        None => after_marker.to_string(),
    }
}

/// Truncates `text` at the leftmost occurrence of any stop sequence.
/// Returns `text` unchanged if no stop sequence occurs in it.
pub fn apply_stop_sequences(text: &str, stop_sequences: &[&str]) -> String {
    let mut earliest: Option<usize> = None;
    for stop in stop_sequences {
        if stop.is_empty() {
            continue;
        }
        if let Some(pos) = text.find(stop) {
            earliest = Some(earliest.map_or(pos, |e: usize| e.min(pos)));
        }
    }

    match earliest {
        Some(pos) => text[..pos].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_process_non_gptoss_passthrough() {
        let raw = "plain model output";
        assert_eq!(post_process_generated_text(raw, false), raw);
    }

    #[test]
    fn test_post_process_extracts_final_channel() {
        let raw = "<|start|>assistant<|channel|>analysis<|message|>think<|end|><|start|>assistant<|channel|>final<|message|>the answer<|end|>";
        assert_eq!(post_process_generated_text(raw, true), "the answer");
    }

    #[test]
    fn test_post_process_unterminated_final_channel_not_truncated_to_empty() {
        let raw = "<|start|>assistant<|channel|>final<|message|>Hello world";
        assert_eq!(post_process_generated_text(raw, true), "Hello world");
    }

    #[test]
    fn test_post_process_no_channel_marker_passthrough() {
        let raw = "no harmony markup here";
        assert_eq!(post_process_generated_text(raw, true), raw);
    }

    #[test]
    fn test_apply_stop_sequences_leftmost_match() {
        let text = "the quick brown fox";
        assert_eq!(apply_stop_sequences(text, &["brown", "quick"]), "the ");
    }

    #[test]
    fn test_apply_stop_sequences_no_match_passthrough() {
        let text = "unchanged text";
        assert_eq!(apply_stop_sequences(text, &["nope"]), text);
    }

    #[test]
    fn test_apply_stop_sequences_empty_list_passthrough() {
        let text = "unchanged";
        assert_eq!(apply_stop_sequences(text, &[]), text);
    }

    #[test]
    fn test_apply_stop_sequences_subset_is_noop() {
        // applyStopSequences(generate(x) || stop) == generate(x) when stop subset of generate(x)
        let generated = "result without any stop markers";
        assert_eq!(apply_stop_sequences(generated, &["xyz-not-present"]), generated);
    }
}
