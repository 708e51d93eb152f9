use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, parse_upstream_error};
use crate::http::{DynHttpTransport, collect_body_text, post_json_stream_with_headers};
use crate::stream::SseDecoder;
use crate::types::{Message, Provider, ResponseEnvelope};

use super::{ProviderAdapter, fragment_stream};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4";

/// Streaming-delta adapter for the OpenAI Chat Completions API.
///
/// Every `choices[0].delta.content` is forwarded as one fragment the moment it
/// arrives; nothing is buffered.
pub struct OpenAiChatAdapter {
    pub(crate) transport: DynHttpTransport,
    pub(crate) base_url: String,
    pub(crate) api_key: String,
    pub(crate) organization: Option<String>,
    pub(crate) default_model: String,
}

impl OpenAiChatAdapter {
    pub fn new(transport: DynHttpTransport, api_key: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            organization: None,
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Points the adapter at a proxy or compatible server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    /// Model used when a request does not name one.
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub(crate) fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn build_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(
            "Authorization".to_string(),
            format!("Bearer {}", self.api_key),
        );
        headers.insert("Accept".to_string(), "text/event-stream".to_string());
        if let Some(org) = &self.organization {
            headers.insert("OpenAI-Organization".to_string(), org.clone());
        }
        headers
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Text carried by one completion chunk; empty when the delta has no content.
fn extract_delta_text(data: &str) -> Result<String, GatewayError> {
    let chunk: ChatCompletionChunk = serde_json::from_str(data).map_err(|err| {
        GatewayError::upstream(Provider::OpenAi, format!("failed to parse stream chunk: {err}"))
    })?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .unwrap_or_default())
}

#[async_trait]
impl ProviderAdapter for OpenAiChatAdapter {
    async fn invoke(
        &self,
        messages: &[Message],
        model: Option<&str>,
    ) -> Result<ResponseEnvelope, GatewayError> {
        let body = ChatCompletionBody {
            model: model.unwrap_or(&self.default_model),
            messages,
            stream: true,
        };
        let response = post_json_stream_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
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
            extract_delta_text,
        )))
    }

    fn provider(&self) -> Provider {
        Provider::OpenAi
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::adapter::testing::ScriptedTransport;

    async fn collect_text(envelope: ResponseEnvelope) -> String {
        match envelope {
            ResponseEnvelope::Stream(stream) => {
                let bytes: Vec<Vec<u8>> = stream.collect().await;
                String::from_utf8(bytes.concat()).expect("utf8")
            }
            ResponseEnvelope::Whole(text) => panic!("expected stream, got whole {text:?}"),
        }
    }

    #[test]
    fn extract_delta_text_defaults_to_empty() {
        let role_only = r#"{"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        assert_eq!(extract_delta_text(role_only).unwrap(), "");
        let no_choices = r#"{"choices":[]}"#;
        assert_eq!(extract_delta_text(no_choices).unwrap(), "");
        let text = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(extract_delta_text(text).unwrap(), "Hel");
        assert!(extract_delta_text("not json").is_err());
    }

    #[tokio::test]
    async fn invoke_streams_delta_fragments() {
        let transport = Arc::new(ScriptedTransport::new(
            200,
            vec![
                "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"lo!\"}}]}\n\ndata: [DONE]\n\n",
            ],
        ));
        let adapter = OpenAiChatAdapter::new(transport.clone(), "sk-test");

        let messages = vec![Message::user("hi")];
        let envelope = adapter.invoke(&messages, None).await.expect("invoke");
        assert_eq!(collect_text(envelope).await, "Hello!");

        let body = transport.last_body();
        assert_eq!(
            body,
            json!({
                "model": "gpt-4",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true
            })
        );
        let request = transport.last_request();
        assert_eq!(request.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(
            request.headers.get("Authorization"),
            Some(&"Bearer sk-test".to_string())
        );
    }

    #[tokio::test]
    async fn invoke_honours_model_override_and_base_url() {
        let transport = Arc::new(ScriptedTransport::new(200, vec!["data: [DONE]\n\n"]));
        let adapter = OpenAiChatAdapter::new(transport.clone(), "sk-test")
            .with_base_url("http://localhost:8080/v1/");

        let envelope = adapter.invoke(&[], Some("gpt-4o-mini")).await.expect("invoke");
        assert_eq!(collect_text(envelope).await, "");
        assert_eq!(transport.last_body()["model"], "gpt-4o-mini");
        assert_eq!(transport.last_body()["messages"], json!([]));
        assert_eq!(
            transport.last_request().url,
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_output() {
        let transport = Arc::new(
            ScriptedTransport::new(
                200,
                vec!["data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n\n"],
            )
            .failing_after("connection reset"),
        );
        let adapter = OpenAiChatAdapter::new(transport, "sk-test");
        let envelope = adapter
            .invoke(&[Message::user("hi")], None)
            .await
            .expect("invoke");
        assert_eq!(collect_text(envelope).await, "partial");
    }

    #[tokio::test]
    async fn non_success_status_is_an_upstream_error() {
        let transport = Arc::new(ScriptedTransport::new(
            401,
            vec![r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#],
        ));
        let adapter = OpenAiChatAdapter::new(transport, "sk-bad");
        let err = adapter
            .invoke(&[Message::user("hi")], None)
            .await
            .expect_err("should fail");
        match err {
            GatewayError::Upstream { provider, message } => {
                assert_eq!(provider, Provider::OpenAi);
                assert!(message.contains("Incorrect API key provided"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
