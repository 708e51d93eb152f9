use std::collections::HashMap;
use std::future;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::dispatcher::Gateway;
use crate::error::GatewayError;
use crate::http::{DynHttpTransport, collect_body_text, post_json_stream_with_headers};
use crate::types::{ErrorResponse, ProviderRequest, ResponseEnvelope, WholeResponse};

/// Client for a gateway served over HTTP by [`crate::server`].
///
/// A JSON reply is read as a whole response; any other successful reply is
/// treated as a raw text stream.
pub struct RemoteGateway {
    transport: DynHttpTransport,
    base_url: String,
}

impl RemoteGateway {
    pub fn new(transport: DynHttpTransport, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
        }
    }

    pub(crate) fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Gateway for RemoteGateway {
    async fn send(&self, request: ProviderRequest) -> Result<ResponseEnvelope, GatewayError> {
        let response = post_json_stream_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            HashMap::new(),
            &request,
        )
        .await?;

        let is_json = response
            .header("content-type")
            .is_some_and(|value| value.starts_with("application/json"));

        if !response.is_success() {
            let status = response.status;
            let text = collect_body_text(response.body).await?;
            let message = serde_json::from_str::<ErrorResponse>(&text)
                .map(|body| body.error)
                .unwrap_or(text);
            return Err(GatewayError::Remote { status, message });
        }

        if is_json {
            let text = collect_body_text(response.body).await?;
            let body: WholeResponse = serde_json::from_str(&text).map_err(|err| {
                GatewayError::transport(format!("malformed gateway response: {err}"))
            })?;
            return Ok(ResponseEnvelope::Whole(body.response));
        }

        let fragments = response.body.scan((), |_, chunk| {
            future::ready(match chunk {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    tracing::warn!(error = %err, "gateway stream interrupted");
                    None
                }
            })
        });
        Ok(ResponseEnvelope::Stream(Box::pin(fragments)))
    }
}
