use std::sync::Arc;

use async_trait::async_trait;

use crate::adapter::DynAdapter;
use crate::error::GatewayError;
use crate::types::{Provider, ProviderRequest, ResponseEnvelope};

/// Anything that turns a [`ProviderRequest`] into a [`ResponseEnvelope`].
///
/// The conversation controller depends only on this seam, so it runs the same
/// against the in-process [`Dispatcher`] or a [`crate::remote::RemoteGateway`].
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send(&self, request: ProviderRequest) -> Result<ResponseEnvelope, GatewayError>;
}

/// Thread-safe gateway handle.
pub type DynGateway = Arc<dyn Gateway>;

/// Routes requests to one adapter per provider.
///
/// Routing looks only at `request.provider`; the messages are passed through
/// untouched. There are no retries and no timeouts at this level.
pub struct Dispatcher {
    openai: DynAdapter,
    anthropic: DynAdapter,
    google: DynAdapter,
}

impl Dispatcher {
    /// Starts a builder; every provider must be registered before `build`.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Validates the provider, invokes its adapter exactly once and tags failures.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidProvider`] for unknown providers, before any
    /// network activity, and [`GatewayError::Upstream`] when the adapter fails.
    pub async fn dispatch(&self, request: ProviderRequest) -> Result<ResponseEnvelope, GatewayError> {
        let ProviderRequest {
            messages,
            provider,
            model,
        } = request;

        tracing::info!(
            %provider,
            model = model.as_deref().unwrap_or("<default>"),
            message_count = messages.len(),
            "received chat request"
        );

        let provider = provider.parse::<Provider>()?;
        let adapter = match provider {
            Provider::OpenAi => &self.openai,
            Provider::Anthropic => &self.anthropic,
            Provider::Google => &self.google,
        };

        adapter
            .invoke(&messages, model.as_deref())
            .await
            .map_err(|err| {
                tracing::error!(%provider, error = %err, "adapter call failed");
                match err {
                    GatewayError::Upstream { .. } => err,
                    other => GatewayError::upstream(provider, other.to_string()),
                }
            })
    }
}

#[async_trait]
impl Gateway for Dispatcher {
    async fn send(&self, request: ProviderRequest) -> Result<ResponseEnvelope, GatewayError> {
        self.dispatch(request).await
    }
}

/// Collects the three adapters a [`Dispatcher`] needs.
#[derive(Default)]
pub struct DispatcherBuilder {
    openai: Option<DynAdapter>,
    anthropic: Option<DynAdapter>,
    google: Option<DynAdapter>,
}

impl DispatcherBuilder {
    /// Registers an adapter under the provider it reports.
    pub fn register(mut self, adapter: DynAdapter) -> Self {
        let slot = match adapter.provider() {
            Provider::OpenAi => &mut self.openai,
            Provider::Anthropic => &mut self.anthropic,
            Provider::Google => &mut self.google,
        };
        *slot = Some(adapter);
        self
    }

    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidConfig`] naming the first provider left
    /// without an adapter.
    pub fn build(self) -> Result<Dispatcher, GatewayError> {
        fn require(slot: Option<DynAdapter>, provider: Provider) -> Result<DynAdapter, GatewayError> {
            slot.ok_or_else(|| GatewayError::InvalidConfig {
                field: provider.id().to_string(),
                reason: "no adapter registered".to_string(),
            })
        }

        Ok(Dispatcher {
            openai: require(self.openai, Provider::OpenAi)?,
            anthropic: require(self.anthropic, Provider::Anthropic)?,
            google: require(self.google, Provider::Google)?,
        })
    }
}
