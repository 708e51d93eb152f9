use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use serde::Serialize;

use crate::error::GatewayError;

/// JSON POST request issued by adapters and the remote gateway client.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Builds a POST request with a JSON body.
    ///
    /// # Examples
    ///
    /// ```
    /// use kotoba_chat::http::HttpRequest;
    ///
    /// let request = HttpRequest::post_json("https://example.com", br"{}".to_vec());
    /// assert_eq!(request.headers.get("Content-Type"), Some(&"application/json".to_string()));
    /// ```
    pub fn post_json(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::from([("Content-Type".to_string(), "application/json".to_string())]),
            body,
        }
    }

    /// Adds headers on top of the defaults, replacing entries with the same name.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// Fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Converts the body into a UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the body is not valid UTF-8.
    pub fn into_string(self) -> Result<String, GatewayError> {
        String::from_utf8(self.body).map_err(|err| GatewayError::transport(err.to_string()))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP response whose body is still arriving.
pub struct HttpStreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: HttpBodyStream,
}

impl HttpStreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Looks up a response header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Alias for the body stream returned by [`HttpTransport::send_stream`].
pub type HttpBodyStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, GatewayError>> + Send>>;

/// Transport abstraction that decouples adapters from the concrete HTTP client.
///
/// Tests substitute in-memory implementations; production uses
/// [`reqwest::ReqwestTransport`].
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a request and resolves once the full body is available.
    ///
    /// # Errors
    ///
    /// Implementations map network failures to [`GatewayError::Transport`].
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, GatewayError>;

    /// Sends a request and resolves as soon as the status line and headers arrive.
    ///
    /// # Errors
    ///
    /// Implementations map network failures to [`GatewayError::Transport`].
    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, GatewayError>;
}

/// Thread-safe handle to a transport implementation.
pub type DynHttpTransport = Arc<dyn HttpTransport>;

fn encode_json<T: Serialize>(body: &T) -> Result<Vec<u8>, GatewayError> {
    serde_json::to_vec(body).map_err(|err| GatewayError::Validation {
        message: format!("failed to serialize request: {err}"),
    })
}

/// Serializes `body` to JSON, attaches `headers`, and issues a buffered POST.
///
/// # Errors
///
/// Returns [`GatewayError::Validation`] if serialization fails, otherwise forwards
/// whatever [`HttpTransport::send`] reports.
pub async fn post_json_with_headers<T: Serialize>(
    transport: &dyn HttpTransport,
    url: impl Into<String>,
    headers: HashMap<String, String>,
    body: &T,
) -> Result<HttpResponse, GatewayError> {
    let request = HttpRequest::post_json(url, encode_json(body)?).with_headers(headers);
    transport.send(request).await
}

/// Streaming counterpart of [`post_json_with_headers`].
///
/// # Errors
///
/// Returns [`GatewayError::Validation`] if serialization fails, otherwise forwards
/// whatever [`HttpTransport::send_stream`] reports.
pub async fn post_json_stream_with_headers<T: Serialize>(
    transport: &dyn HttpTransport,
    url: impl Into<String>,
    headers: HashMap<String, String>,
    body: &T,
) -> Result<HttpStreamResponse, GatewayError> {
    let request = HttpRequest::post_json(url, encode_json(body)?).with_headers(headers);
    transport.send_stream(request).await
}

/// Drains a streaming body into a string, used to decode error payloads.
pub(crate) async fn collect_body_text(mut body: HttpBodyStream) -> Result<String, GatewayError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = body.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    String::from_utf8(bytes)
        .map_err(|err| GatewayError::transport(format!("failed to decode error body: {err}")))
}

pub mod reqwest;
