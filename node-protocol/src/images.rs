//! `/v1/images/generations` types. Edits/variations share the response shape
//! but take multipart input handled directly by the admission layer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub steps: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageResponse {
    pub created: i64,
    pub data: Vec<ImageData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
}

impl ImageResponse {
    pub fn from_b64(images: Vec<String>) -> Self {
        Self {
            created: chrono::Utc::now().timestamp(),
            data: images
                .into_iter()
                .map(|b64| ImageData {
                    url: None,
                    b64_json: Some(b64),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_response_from_b64() {
        let resp = ImageResponse::from_b64(vec!["abc".to_string()]);
        assert_eq!(resp.data.len(), 1);
        assert_eq!(resp.data[0].b64_json, Some("abc".to_string()));
        assert!(resp.data[0].url.is_none());
    }

    #[test]
    fn test_image_data_skips_absent_fields() {
        let data = ImageData {
            url: Some("http://x/y.png".to_string()),
            b64_json: None,
        };
        let json = serde_json::to_string(&data).unwrap();
        assert_eq!(json, r#"{"url":"http://x/y.png"}"#);
    }
}
