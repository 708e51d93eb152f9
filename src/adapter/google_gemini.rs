use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, parse_upstream_error};
use crate::http::{DynHttpTransport, collect_body_text, post_json_stream_with_headers};
use crate::stream::SseDecoder;
use crate::types::{Message, Provider, ResponseEnvelope, Role};

use super::{ProviderAdapter, fragment_stream};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODEL: &str = "gemini-pro";

/// Text-chunk-stream adapter for Gemini `streamGenerateContent`.
///
/// Messages are reshaped into Gemini turns (`assistant` becomes `model`) and every
/// streamed `GenerateContentResponse` contributes the text of its first candidate.
pub struct GoogleGeminiAdapter {
    pub(crate) transport: DynHttpTransport,
    pub(crate) base_url: String,
    pub(crate) api_key: String,
    pub(crate) default_model: String,
}

impl GoogleGeminiAdapter {
    pub fn new(transport: DynHttpTransport, api_key: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// SSE endpoint; `model` may be given with or without the `models/` prefix.
    pub(crate) fn stream_endpoint(&self, model: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let model_path = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        };
        if base.ends_with("/v1beta") {
            format!("{base}/{model_path}:streamGenerateContent?alt=sse")
        } else {
            format!("{base}/v1beta/{model_path}:streamGenerateContent?alt=sse")
        }
    }

    fn build_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("x-goog-api-key".to_string(), self.api_key.clone());
        headers.insert("Accept".to_string(), "text/event-stream".to_string());
        headers
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct GeminiContent {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateContentBody {
    contents: Vec<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

fn to_gemini_contents(messages: &[Message]) -> Vec<GeminiContent> {
    messages
        .iter()
        .map(|message| GeminiContent {
            role: Some(
                match message.role {
                    Role::Assistant => "model",
                    Role::User => "user",
                }
                .to_string(),
            ),
            parts: vec![GeminiPart {
                text: Some(message.content.clone()),
            }],
        })
        .collect()
}

/// Text accessor for one streamed response: the first candidate's text parts, joined.
fn extract_chunk_text(data: &str) -> Result<String, GatewayError> {
    let chunk: GenerateContentResponse = serde_json::from_str(data).map_err(|err| {
        GatewayError::upstream(Provider::Google, format!("failed to parse stream chunk: {err}"))
    })?;
    Ok(chunk
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<String>()
        })
        .unwrap_or_default())
}

#[async_trait]
impl ProviderAdapter for GoogleGeminiAdapter {
    async fn invoke(
        &self,
        messages: &[Message],
        model: Option<&str>,
    ) -> Result<ResponseEnvelope, GatewayError> {
        let model = model.unwrap_or(&self.default_model);
        let body = GenerateContentBody {
            contents: to_gemini_contents(messages),
        };
        let response = post_json_stream_with_headers(
            self.transport.as_ref(),
            self.stream_endpoint(model),
            self.build_headers(),
            &body,
        )
        .await?;

        if !response.is_success() {
            let text = collect_body_text(response.body).await?;
            return Err(parse_upstream_error(self.provider(), response.status, &text));
        }

        let decoder = SseDecoder::new(response.body, self.provider());
        Ok(ResponseEnvelope::Stream(fragment_stream(
            decoder,
            self.provider(),
            extract_chunk_text,
        )))
    }

    fn provider(&self) -> Provider {
        Provider::Google
    }
}
