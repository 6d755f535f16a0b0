//! Capability types for the inference node.

use serde::{Deserialize, Serialize};

/// The kind of inference a request demands.
///
/// These are the capability tags an engine declares support for and that a
/// request resolves against when a model is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Chat / text completion.
    Text,
    /// Vector embeddings generation.
    Embeddings,
    /// Image generation (text-to-image).
    Image,
    /// Speech-to-text (automatic speech recognition).
    AudioAsr,
    /// Text-to-speech synthesis.
    AudioTts,
    /// Vision/chat-with-images understanding.
    ImageUnderstanding,
}

impl Capability {
    /// All capability variants.
    pub const ALL: [Capability; 6] = [
        Capability::Text,
        Capability::Embeddings,
        Capability::Image,
        Capability::AudioAsr,
        Capability::AudioTts,
        Capability::ImageUnderstanding,
    ];

    /// Parse the wire string accepted in `loadModel`'s `capability` argument.
    /// Returns `None` for unrecognized values so callers can map to `kUnsupported`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Capability::Text),
            "embeddings" => Some(Capability::Embeddings),
            "image" => Some(Capability::Image),
            "audio_asr" => Some(Capability::AudioAsr),
            "audio_tts" => Some(Capability::AudioTts),
            "image_understanding" => Some(Capability::ImageUnderstanding),
            _ => None,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Text => write!(f, "text"),
            Capability::Embeddings => write!(f, "embeddings"),
            Capability::Image => write!(f, "image"),
            Capability::AudioAsr => write!(f, "audio_asr"),
            Capability::AudioTts => write!(f, "audio_tts"),
            Capability::ImageUnderstanding => write!(f, "image_understanding"),
        }
    }
}

/// Status of a capability on the node, reported in heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum CapabilityStatus {
    /// Model not loaded, can be loaded on demand.
    Unloaded,
    /// Model is being loaded.
    Loading {
        #[serde(default)]
        progress: Option<f32>,
    },
    /// Model is loaded and ready for inference.
    Loaded,
    /// Model is being unloaded.
    Unloading,
    /// Model failed to load or encountered an error.
    Error { message: String },
}

impl CapabilityStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, CapabilityStatus::Loaded)
    }

    pub fn is_available(&self) -> bool {
        matches!(self, CapabilityStatus::Loaded | CapabilityStatus::Unloaded)
    }
}

/// Information about a capability provided by the node, used in heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub capability: Capability,
    pub status: CapabilityStatus,
    pub model_id: String,
    #[serde(default)]
    pub active_requests: u32,
    #[serde(default)]
    pub avg_latency_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_serialization() {
        let cap = Capability::AudioAsr;
        let json = serde_json::to_string(&cap).unwrap();
        assert_eq!(json, r#""audio_asr""#);

        let parsed: Capability = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Capability::AudioAsr);
    }

    #[test]
    fn test_capability_parse_roundtrip() {
        for cap in Capability::ALL {
            assert_eq!(Capability::parse(&cap.to_string()), Some(cap));
        }
    }

    #[test]
    fn test_capability_parse_unknown() {
        assert_eq!(Capability::parse("smell_o_vision"), None);
    }

    #[test]
    fn test_capability_status_serialization() {
        let status = CapabilityStatus::Loading {
            progress: Some(0.5),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains(r#""status":"loading""#));
        assert!(json.contains(r#""progress":0.5"#));
    }

    #[test]
    fn test_capability_status_is_ready() {
        assert!(CapabilityStatus::Loaded.is_ready());
        assert!(!CapabilityStatus::Unloaded.is_ready());
        assert!(!CapabilityStatus::Loading { progress: None }.is_ready());
    }
}
