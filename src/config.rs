use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::DynAdapter;
use crate::adapter::anthropic_messages::AnthropicMessagesAdapter;
use crate::adapter::google_gemini::GoogleGeminiAdapter;
use crate::adapter::openai_chat::OpenAiChatAdapter;
use crate::dispatcher::Dispatcher;
use crate::error::GatewayError;
use crate::http::DynHttpTransport;
use crate::types::Provider;

/// Settings for one upstream provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Missing keys are allowed; the upstream rejects the call instead.
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Model used when a request does not name one.
    pub default_model: Option<String>,
    /// Provider specific knobs, e.g. `organization`, `version`, `max_tokens`
    /// or `separator`.
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

/// Settings for all three providers the gateway serves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub openai: ProviderConfig,
    #[serde(default)]
    pub anthropic: ProviderConfig,
    #[serde(default)]
    pub google: ProviderConfig,
}

impl GatewayConfig {
    /// Reads `<PROVIDER>_API_KEY`, `<PROVIDER>_BASE_URL` and
    /// `<PROVIDER>_DEFAULT_MODEL` for every provider.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |provider: Provider| {
            let prefix = provider.id().to_ascii_uppercase();
            let var = |suffix: &str| {
                lookup(&format!("{prefix}_{suffix}")).filter(|value| !value.trim().is_empty())
            };
            ProviderConfig {
                api_key: var("API_KEY"),
                base_url: var("BASE_URL"),
                default_model: var("DEFAULT_MODEL"),
                extra: HashMap::new(),
            }
        };
        Self {
            openai: read(Provider::OpenAi),
            anthropic: read(Provider::Anthropic),
            google: read(Provider::Google),
        }
    }

    pub fn provider(&self, provider: Provider) -> &ProviderConfig {
        match provider {
            Provider::OpenAi => &self.openai,
            Provider::Anthropic => &self.anthropic,
            Provider::Google => &self.google,
        }
    }
}

/// Builds a dispatcher with one adapter per provider from `config`.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidConfig`] when an `extra` entry has the wrong type.
pub fn build_dispatcher_from_config(
    config: &GatewayConfig,
    transport: DynHttpTransport,
) -> Result<Dispatcher, GatewayError> {
    let mut builder = Dispatcher::builder();
    for provider in Provider::ALL {
        builder = builder.register(build_adapter_from_config(
            provider,
            config.provider(provider),
            transport.clone(),
        )?);
    }
    builder.build()
}

fn build_adapter_from_config(
    provider: Provider,
    config: &ProviderConfig,
    transport: DynHttpTransport,
) -> Result<DynAdapter, GatewayError> {
    let api_key = match &config.api_key {
        Some(key) => key.clone(),
        None => {
            tracing::warn!(%provider, "no API key configured; upstream calls will be rejected");
            String::new()
        }
    };

    let adapter: DynAdapter = match provider {
        Provider::OpenAi => {
            let mut adapter = OpenAiChatAdapter::new(transport, api_key);

            if let Some(base_url) = &config.base_url {
                adapter = adapter.with_base_url(base_url.clone());
            }
            if let Some(model) = &config.default_model {
                adapter = adapter.with_default_model(model.clone());
            }

            if let Some(org) = extra_str(config, provider, "organization")? {
                adapter = adapter.with_organization(org);
            }

            Arc::new(adapter)
        }
        Provider::Anthropic => {
            let mut adapter = AnthropicMessagesAdapter::new(transport, api_key);

            if let Some(base_url) = &config.base_url {
                adapter = adapter.with_base_url(base_url.clone());
            }
            if let Some(model) = &config.default_model {
                adapter = adapter.with_default_model(model.clone());
            }

            if let Some(version) = extra_str(config, provider, "version")? {
                adapter = adapter.with_version(version);
            }
            if let Some(separator) = extra_str(config, provider, "separator")? {
                adapter = adapter.with_separator(separator);
            }
            if let Some(value) = config.extra.get("max_tokens") {
                let max_tokens = value
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| {
                        invalid_extra(provider, "max_tokens", "expected a positive integer")
                    })?;
                adapter = adapter.with_max_tokens(max_tokens);
            }

            Arc::new(adapter)
        }
        Provider::Google => {
            let mut adapter = GoogleGeminiAdapter::new(transport, api_key);

            if let Some(base_url) = &config.base_url {
                adapter = adapter.with_base_url(base_url.clone());
            }
            if let Some(model) = &config.default_model {
                adapter = adapter.with_default_model(model.clone());
            }

            Arc::new(adapter)
        }
    };

    Ok(adapter)
}

fn extra_str(
    config: &ProviderConfig,
    provider: Provider,
    key: &str,
) -> Result<Option<String>, GatewayError> {
    match config.extra.get(key) {
        None => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(invalid_extra(provider, key, "expected a string")),
    }
}

fn invalid_extra(provider: Provider, key: &str, reason: &str) -> GatewayError {
    GatewayError::InvalidConfig {
        field: format!("{provider}.{key}"),
        reason: reason.to_string(),
    }
}
