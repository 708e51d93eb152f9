use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, parse_upstream_error};
use crate::http::{DynHttpTransport, post_json_with_headers};
use crate::types::{Message, Provider, ResponseEnvelope, Role};

use super::ProviderAdapter;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-haiku-20240307";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_SEPARATOR: &str = " ";

/// Single-shot adapter for the Anthropic Messages API.
///
/// The whole conversation is flattened into one user prompt and the reply is
/// returned atomically, so callers never observe partial output.
pub struct AnthropicMessagesAdapter {
    pub(crate) transport: DynHttpTransport,
    pub(crate) base_url: String,
    pub(crate) api_key: String,
    pub(crate) version: String,
    pub(crate) default_model: String,
    pub(crate) max_tokens: u32,
    pub(crate) separator: String,
}

impl AnthropicMessagesAdapter {
    pub fn new(transport: DynHttpTransport, api_key: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            version: DEFAULT_VERSION.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            separator: DEFAULT_SEPARATOR.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the `anthropic-version` header.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// String placed between consecutive message contents in the flattened prompt.
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub(crate) fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/messages")
        } else {
            format!("{base}/v1/messages")
        }
    }

    fn build_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("x-api-key".to_string(), self.api_key.clone());
        headers.insert("Accept".to_string(), "application/json".to_string());
        headers.insert("anthropic-version".to_string(), self.version.clone());
        headers
    }

    /// Joins every message's content, in order, with the configured separator.
    pub(crate) fn build_prompt(&self, messages: &[Message]) -> String {
        messages
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>()
            .join(self.separator.as_str())
    }
}

#[derive(Debug, Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message; 1],
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl ProviderAdapter for AnthropicMessagesAdapter {
    async fn invoke(
        &self,
        messages: &[Message],
        model: Option<&str>,
    ) -> Result<ResponseEnvelope, GatewayError> {
        let body = MessagesBody {
            model: model.unwrap_or(&self.default_model),
            max_tokens: self.max_tokens,
            messages: [Message {
                role: Role::User,
                content: self.build_prompt(messages),
            }],
        };
        let response = post_json_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            self.build_headers(),
            &body,
        )
        .await?;

        let status = response.status;
        let success = response.is_success();
        let text = response.into_string()?;
        if !success {
            return Err(parse_upstream_error(self.provider(), status, &text));
        }

        let parsed: MessagesResponse = serde_json::from_str(&text).map_err(|err| {
            GatewayError::upstream(
                self.provider(),
                format!("failed to parse Anthropic response: {err}"),
            )
        })?;
        let reply = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<String>();
        Ok(ResponseEnvelope::Whole(reply))
    }

    fn provider(&self) -> Provider {
        Provider::Anthropic
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::adapter::testing::ScriptedTransport;

    fn adapter_with(transport: Arc<ScriptedTransport>) -> AnthropicMessagesAdapter {
        AnthropicMessagesAdapter::new(transport, "ak-test")
    }

    #[test]
    fn build_prompt_preserves_order_and_content() {
        let transport = Arc::new(ScriptedTransport::new(200, vec![]));
        let messages = vec![
            Message::user("first question"),
            Message::assistant("an answer"),
            Message::user("follow up"),
            Message::user("and another"),
        ];

        let spaced = adapter_with(transport.clone()).build_prompt(&messages);
        assert_eq!(spaced, "first question an answer follow up and another");

        let paragraphs = adapter_with(transport)
            .with_separator("\n\n")
            .build_prompt(&messages);
        assert_eq!(
            paragraphs,
            "first question\n\nan answer\n\nfollow up\n\nand another"
        );
        let mut cursor = 0;
        for message in &messages {
            let found = paragraphs[cursor..]
                .find(&message.content)
                .expect("content is kept");
            cursor += found + message.content.len();
        }
    }

    #[tokio::test]
    async fn invoke_returns_whole_reply() {
        let transport = Arc::new(ScriptedTransport::new(
            200,
            vec![
                r#"{"id":"msg_1","type":"message","role":"assistant","model":"claude-3-haiku-20240307",
                   "content":[{"type":"text","text":"Hello "},{"type":"text","text":"there"}],
                   "stop_reason":"end_turn"}"#,
            ],
        ));
        let adapter = adapter_with(transport.clone());
        let messages = vec![Message::user("hi"), Message::user("again")];

        let envelope = adapter.invoke(&messages, None).await.expect("invoke");
        match envelope {
            ResponseEnvelope::Whole(text) => assert_eq!(text, "Hello there"),
            other => panic!("expected whole envelope, got {other:?}"),
        }

        assert_eq!(
            transport.last_body(),
            json!({
                "model": "claude-3-haiku-20240307",
                "max_tokens": 4096,
                "messages": [{"role": "user", "content": "hi again"}]
            })
        );
        let request = transport.last_request();
        assert_eq!(request.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(request.headers.get("x-api-key"), Some(&"ak-test".to_string()));
        assert_eq!(
            request.headers.get("anthropic-version"),
            Some(&"2023-06-01".to_string())
        );
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn invoke_uses_model_override() {
        let transport = Arc::new(ScriptedTransport::new(200, vec![r#"{"content":[]}"#]));
        let adapter = adapter_with(transport.clone()).with_max_tokens(256);
        let envelope = adapter
            .invoke(&[], Some("claude-3-opus-20240229"))
            .await
            .expect("invoke");
        assert!(matches!(envelope, ResponseEnvelope::Whole(ref text) if text.is_empty()));
        let body = transport.last_body();
        assert_eq!(body["model"], "claude-3-opus-20240229");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][0]["content"], "");
    }

    #[tokio::test]
    async fn invoke_maps_error_status() {
        let transport = Arc::new(ScriptedTransport::new(
            529,
            vec![r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#],
        ));
        let err = adapter_with(transport)
            .invoke(&[Message::user("hi")], None)
            .await
            .expect_err("should fail");
        assert_eq!(
            err.to_string(),
            "Anthropic error: status 529: Overloaded (overloaded_error)"
        );
    }

    #[tokio::test]
    async fn invoke_rejects_malformed_body() {
        let transport = Arc::new(ScriptedTransport::new(200, vec!["<html>"]));
        let err = adapter_with(transport)
            .invoke(&[Message::user("hi")], None)
            .await
            .expect_err("should fail");
        assert!(matches!(
            err,
            GatewayError::Upstream {
                provider: Provider::Anthropic,
                ..
            }
        ));
    }
}
