//! Wire types for an OpenAI-compatible `/chat/completions` endpoint, plus
//! the transport-neutral [`InferenceRequest`] the search engine speaks.

use serde::{Deserialize, Serialize};

/// Why a call is being made. Decides the model, sampling and image policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    /// First proposal for a work item.
    Initial,
    /// One refinement step under a named strategy.
    Refine,
    /// Terminal step that discloses the reference answer.
    Guided,
    /// Verification against the reference answer.
    Verify,
    /// Natural-language narrative of the whole attempt transcript.
    Narrate,
    /// Final structured response built from the narrative.
    Finalize,
}

impl CallPurpose {
    /// Text-only calls go to the verifier model at fixed low temperature.
    pub fn is_text_only(self) -> bool {
        matches!(
            self,
            CallPurpose::Verify | CallPurpose::Narrate | CallPurpose::Finalize
        )
    }
}

/// One call against the inference service, independent of the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub purpose: CallPurpose,
    pub prompt: String,
    /// Local paths or `http(s)` URLs. Ignored for text-only purposes.
    pub images: Vec<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl InferenceRequest {
    /// A multimodal generation call carrying the item's context images.
    pub fn generation(
        purpose: CallPurpose,
        prompt: String,
        images: &[String],
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            purpose,
            prompt,
            images: images.to_vec(),
            max_tokens,
            temperature,
        }
    }

    /// A deterministic text-only call (verification, synthesis).
    pub fn text_only(purpose: CallPurpose, prompt: String, max_tokens: u32) -> Self {
        Self {
            purpose,
            prompt,
            images: Vec::new(),
            max_tokens,
            temperature: 0.0,
        }
    }
}

/// Request body for `POST {base_url}/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A chat message whose content is a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Vec<ContentPart>,
}

/// One content part. Serialized with a `"type"` tag, as the API expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Response body of `/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// Token accounting reported by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}
