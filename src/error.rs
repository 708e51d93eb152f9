use serde::Deserialize;
use thiserror::Error;

use crate::types::Provider;

/// Aggregates every failure mode exposed by the gateway and its adapters.
///
/// The HTTP boundary maps each variant onto a status code via
/// [`GatewayError::status_code`]; the conversation controller never shows these
/// messages to the end user verbatim.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The request named a provider outside the supported set.
    #[error("Invalid provider")]
    InvalidProvider {
        /// Raw provider identifier received from the caller.
        provider: String,
    },
    /// An adapter call was rejected by, or returned garbage from, its upstream API.
    #[error("{} error: {message}", .provider.display_label())]
    Upstream {
        provider: Provider,
        /// Upstream message, kept verbatim for debugging.
        message: String,
    },
    /// Represents transport-layer or networking failures.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// Signals validation failures in a request payload.
    #[error("invalid request: {message}")]
    Validation { message: String },
    /// Raised when building or validating configuration fails.
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },
    /// Durable session storage could not be read or written.
    #[error("storage error: {message}")]
    Storage { message: String },
    /// A remote gateway answered with a non-success status.
    #[error("gateway responded with status {status}: {message}")]
    Remote { status: u16, message: String },
}

impl GatewayError {
    /// Creates a [`GatewayError::Transport`] from a textual description.
    ///
    /// # Examples
    ///
    /// ```
    /// use kotoba_chat::error::GatewayError;
    ///
    /// let err = GatewayError::transport("dns lookup failed");
    /// assert!(matches!(err, GatewayError::Transport { .. }));
    /// ```
    pub fn transport<T: Into<String>>(message: T) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a [`GatewayError::Upstream`] tagged with the failing provider.
    ///
    /// # Examples
    ///
    /// ```
    /// use kotoba_chat::error::GatewayError;
    /// use kotoba_chat::types::Provider;
    ///
    /// let err = GatewayError::upstream(Provider::OpenAi, "bad JSON payload");
    /// assert_eq!(err.to_string(), "OpenAI error: bad JSON payload");
    /// ```
    pub fn upstream<T: Into<String>>(provider: Provider, message: T) -> Self {
        Self::Upstream {
            provider,
            message: message.into(),
        }
    }

    pub fn storage<T: Into<String>>(message: T) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// HTTP status used when this error crosses the gateway boundary.
    ///
    /// Only an unknown provider is user-correctable; everything else is a 500.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidProvider { .. } => 400,
            Self::Remote { status, .. } => *status,
            _ => 500,
        }
    }
}

/// Decodes a non-success upstream body into a [`GatewayError::Upstream`].
///
/// OpenAI, Anthropic and Gemini all report failures as
/// `{"error": {"message": ...}}`; anything else is surfaced with its raw body.
pub(crate) fn parse_upstream_error(provider: Provider, status: u16, body: &str) -> GatewayError {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<InnerError>,
    }

    #[derive(Deserialize)]
    struct InnerError {
        message: Option<String>,
        #[serde(default, alias = "status")]
        r#type: Option<String>,
    }

    if let Ok(ErrorBody { error: Some(inner) }) = serde_json::from_str::<ErrorBody>(body) {
        let mut message = inner.message.unwrap_or_else(|| "unknown error".to_string());
        if let Some(kind) = inner.r#type {
            message = format!("{message} ({kind})");
        }
        return GatewayError::upstream(provider, format!("status {status}: {message}"));
    }

    GatewayError::upstream(provider, format!("status {status}: {}", body.trim()))
}
