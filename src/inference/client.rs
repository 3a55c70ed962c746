use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use tracing::{debug, warn};

use super::error::InferenceError;
use super::types::{
    ChatMessage, ChatRequest, ChatResponse, ContentPart, ImageUrl, InferenceRequest,
};
use crate::config::SearchConfig;

/// Seam between the search engine and the inference service.
///
/// The engine only ever sees this trait, which keeps the HTTP client out of
/// the state machine tests.
pub trait InferenceClient: Send + Sync {
    /// Issue one call and return the reply text. Blank replies are errors.
    fn complete(
        &self,
        req: &InferenceRequest,
    ) -> impl Future<Output = Result<String, InferenceError>> + Send;
}

/// Issue one call bounded by `timeout`. Expiry is an ordinary error.
pub async fn complete_within<C: InferenceClient>(
    client: &C,
    req: &InferenceRequest,
    timeout: Duration,
) -> Result<String, InferenceError> {
    match tokio::time::timeout(timeout, client.complete(req)).await {
        Ok(result) => result,
        Err(_) => Err(InferenceError::Timeout),
    }
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint
/// (OpenRouter by default).
pub struct OpenAiClient {
    api_key: String,
    client: Client,
    base_url: String,
    model: String,
    verifier_model: String,
    images_dir: Option<PathBuf>,
}

impl OpenAiClient {
    pub fn from_config(config: &SearchConfig) -> Result<Self, InferenceError> {
        let mut client = Self::with_base_url(
            config.api_key.clone(),
            config.api_url.clone(),
            config.model_name.clone(),
            config.verifier_model.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        client.images_dir = config.images_dir.clone();
        Ok(client)
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(
        api_key: String,
        base_url: String,
        model: String,
        verifier_model: String,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            api_key,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            verifier_model,
            images_dir: None,
        })
    }

    async fn build_request(&self, req: &InferenceRequest) -> Result<ChatRequest, InferenceError> {
        let mut content = vec![ContentPart::Text {
            text: req.prompt.clone(),
        }];
        let model = if req.purpose.is_text_only() {
            &self.verifier_model
        } else {
            for source in &req.images {
                content.push(self.image_part(source).await?);
            }
            &self.model
        };

        Ok(ChatRequest {
            model: model.clone(),
            messages: vec![ChatMessage {
                role: "user".into(),
                content,
            }],
            max_tokens: req.max_tokens,
            temperature: req.temperature,
        })
    }

    async fn image_part(&self, source: &str) -> Result<ContentPart, InferenceError> {
        let url = if source.starts_with("http://") || source.starts_with("https://") {
            source.to_string()
        } else {
            let path = resolve_image_path(source, self.images_dir.as_deref());
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|source| InferenceError::Image {
                    path: path.display().to_string(),
                    source,
                })?;
            format!("data:image/jpeg;base64,{}", STANDARD.encode(bytes))
        };
        Ok(ContentPart::ImageUrl {
            image_url: ImageUrl { url },
        })
    }

    async fn send(&self, body: &ChatRequest) -> Result<String, InferenceError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout
                } else {
                    InferenceError::NetworkError(e)
                }
            })?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            warn!(retry_after_ms = retry_after, "inference service rate limited");
            return Err(InferenceError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            warn!(status = %status, error = %message, "inference API error");
            return Err(InferenceError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| InferenceError::MalformedResponse(e.to_string()))?;

        if let Some(usage) = &body.usage {
            debug!(
                response_id = body.id.as_deref().unwrap_or("-"),
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "token usage"
            );
        }
        let choice = body.choices.into_iter().next();
        if choice
            .as_ref()
            .and_then(|c| c.finish_reason.as_deref())
            .is_some_and(|reason| reason == "length")
        {
            warn!("reply truncated at max_tokens");
        }
        let content = choice.and_then(|c| c.message.content).unwrap_or_default();
        if content.trim().is_empty() {
            return Err(InferenceError::EmptyResponse);
        }
        Ok(content)
    }
}

impl InferenceClient for OpenAiClient {
    async fn complete(&self, req: &InferenceRequest) -> Result<String, InferenceError> {
        let start = std::time::Instant::now();
        let body = self.build_request(req).await?;
        let text = self.send(&body).await?;
        debug!(
            purpose = ?req.purpose,
            model = %body.model,
            duration_ms = start.elapsed().as_millis() as u64,
            "inference call completed"
        );
        Ok(text)
    }
}

/// Relative image paths are looked up by file name inside `images_dir`.
fn resolve_image_path(source: &str, images_dir: Option<&Path>) -> PathBuf {
    let path = Path::new(source);
    match images_dir {
        Some(dir) if !path.is_absolute() => match path.file_name() {
            Some(name) => dir.join(name),
            None => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}
