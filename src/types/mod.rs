//! Shared data structures for the provider-agnostic chat contract.
//!
//! These types are what flows between the conversation controller, the gateway
//! dispatcher and the HTTP boundary; provider wire formats never leak past the
//! adapters.

use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use futures_core::Stream;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Normalized chat message shared across providers.
///
/// Consecutive messages with the same role are allowed; adapters must cope.
///
/// # Examples
///
/// ```
/// use kotoba_chat::types::{Message, Role};
///
/// let msg = Message::user("hi");
/// assert_eq!(msg.role, Role::User);
/// assert_eq!(msg.content, "hi");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Upstream LLM vendors reachable through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "google")]
    Google,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::OpenAi, Provider::Anthropic, Provider::Google];

    /// Wire identifier used in gateway requests.
    pub fn id(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        }
    }

    /// Human-readable name shown in provider pickers.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI (GPT-4)",
            Self::Anthropic => "Anthropic (Claude)",
            Self::Google => "Google (Gemini)",
        }
    }

    /// Prefix used for provider-tagged error messages at the gateway boundary.
    pub fn display_label(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::Anthropic => "Anthropic",
            Self::Google => "Google AI",
        }
    }

    /// Models a session may select for this provider; the first one is the default.
    pub fn models(self) -> &'static [&'static str] {
        match self {
            Self::OpenAi => &["gpt-3.5-turbo", "gpt-4o-mini"],
            Self::Anthropic => &["claude-3-opus-20240229", "claude-3-sonnet-20240229"],
            Self::Google => &["gemini-pro"],
        }
    }

    /// Model selected for a fresh session or after switching provider.
    pub fn default_selection(self) -> &'static str {
        self.models()[0]
    }

    pub fn supports_model(self, model: &str) -> bool {
        self.models().contains(&model)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Provider {
    type Err = GatewayError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "google" => Ok(Self::Google),
            other => Err(GatewayError::InvalidProvider {
                provider: other.to_string(),
            }),
        }
    }
}

/// Request accepted by the gateway.
///
/// `provider` stays an open string at this boundary so that unknown values can
/// be rejected with [`GatewayError::InvalidProvider`] instead of a decode error.
/// A missing or non-string `provider` decodes to a value no provider matches.
///
/// # Examples
///
/// ```
/// use kotoba_chat::types::{Message, ProviderRequest};
///
/// let request: ProviderRequest = serde_json::from_str(
///     r#"{"messages":[{"role":"user","content":"hi"}],"provider":"openai"}"#,
/// )
/// .unwrap();
/// assert_eq!(request.messages, vec![Message::user("hi")]);
/// assert!(request.model.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub messages: Vec<Message>,
    #[serde(default, deserialize_with = "provider_or_raw")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ProviderRequest {
    pub fn new(messages: Vec<Message>, provider: Provider, model: Option<String>) -> Self {
        Self {
            messages,
            provider: provider.id().to_string(),
            model,
        }
    }
}

fn provider_or_raw<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(provider) => provider,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Byte fragments of UTF-8 text; the stream ending is the close signal.
///
/// A fragment boundary may split a multi-byte character, so consumers must
/// decode incrementally.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Normalized reply returned by the gateway.
///
/// Which variant comes back is decided by the provider, never by request content.
pub enum ResponseEnvelope {
    /// Text delivered incrementally.
    Stream(FragmentStream),
    /// Text delivered atomically.
    Whole(String),
}

impl fmt::Debug for ResponseEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Whole(text) => f.debug_tuple("Whole").field(text).finish(),
        }
    }
}

/// JSON body of a whole-response reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WholeResponse {
    pub response: String,
}

/// JSON body returned with non-2xx statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parses_known_ids_only() {
        for provider in Provider::ALL {
            assert_eq!(provider.id().parse::<Provider>().unwrap(), provider);
        }
        let err = "foo".parse::<Provider>().unwrap_err();
        match err {
            GatewayError::InvalidProvider { provider } => assert_eq!(provider, "foo"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!("OpenAI".parse::<Provider>().is_err());
    }

    #[test]
    fn model_table_defaults_to_first_entry() {
        assert_eq!(Provider::OpenAi.default_selection(), "gpt-3.5-turbo");
        assert_eq!(Provider::Anthropic.default_selection(), "claude-3-opus-20240229");
        assert_eq!(Provider::Google.default_selection(), "gemini-pro");
        assert!(Provider::OpenAi.supports_model("gpt-4o-mini"));
        assert!(!Provider::Google.supports_model("gpt-4o-mini"));
    }

    #[test]
    fn request_provider_decodes_leniently() {
        let missing: ProviderRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert_eq!(missing.provider, "");

        let numeric: ProviderRequest =
            serde_json::from_str(r#"{"messages":[],"provider":5}"#).unwrap();
        assert_eq!(numeric.provider, "5");
        assert!(numeric.provider.parse::<Provider>().is_err());
    }

    #[test]
    fn messages_serialize_with_lowercase_roles() {
        let value = serde_json::to_value(Message::assistant("ok")).unwrap();
        assert_eq!(value, serde_json::json!({"role": "assistant", "content": "ok"}));
    }
}
