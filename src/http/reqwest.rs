use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::GatewayError;

use super::{
    DynHttpTransport, HttpBodyStream, HttpRequest, HttpResponse, HttpStreamResponse,
    HttpTransport,
};

/// Default [`HttpTransport`] backed by reqwest.
///
/// No request timeout is configured: a stalled upstream keeps the call pending.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Wraps a caller-supplied reqwest client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a transport around a default reqwest client.
    pub fn default_client() -> Result<Self, GatewayError> {
        Client::builder().build().map(Self::new).map_err(|err| {
            GatewayError::transport(format!("failed to create reqwest client: {err}"))
        })
    }

    fn build_request(&self, request: HttpRequest) -> Result<reqwest::RequestBuilder, GatewayError> {
        let mut builder = self.client.post(&request.url);

        for (name, value) in request.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| GatewayError::transport(format!("invalid header name: {err}")))?;
            let header_value = HeaderValue::from_str(&value).map_err(|err| {
                GatewayError::transport(format!("invalid header value for {header_name}: {err}"))
            })?;
            builder = builder.header(header_name, header_value);
        }

        Ok(builder.body(request.body))
    }

    fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, GatewayError> {
        let response = self
            .build_request(request)?
            .send()
            .await
            .map_err(|err| GatewayError::transport(err.to_string()))?;

        let status = response.status().as_u16();
        let headers = Self::headers_to_map(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|err| GatewayError::transport(err.to_string()))?
            .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, GatewayError> {
        let response = self
            .build_request(request)?
            .send()
            .await
            .map_err(|err| GatewayError::transport(err.to_string()))?;

        let status = response.status().as_u16();
        let headers = Self::headers_to_map(response.headers());
        let body: HttpBodyStream = Box::pin(response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|err| GatewayError::transport(err.to_string()))
        }));

        Ok(HttpStreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Convenience constructor for a shared reqwest transport.
pub fn default_dyn_transport() -> Result<DynHttpTransport, GatewayError> {
    Ok(Arc::new(ReqwestTransport::default_client()?))
}
