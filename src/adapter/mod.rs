use std::future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};

use crate::error::GatewayError;
use crate::stream::{SseDecoder, SseEvent};
use crate::types::{FragmentStream, Message, Provider, ResponseEnvelope};

pub mod anthropic_messages;
pub mod google_gemini;
pub mod openai_chat;

pub use anthropic_messages::AnthropicMessagesAdapter;
pub use google_gemini::GoogleGeminiAdapter;
pub use openai_chat::OpenAiChatAdapter;

/// Wire-level bridge to one upstream provider.
///
/// Adapters borrow the conversation, so they cannot mutate it, and treat an empty
/// message list as ordinary input.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Calls the upstream API and normalizes its reply.
    ///
    /// `model` overrides the adapter's default model when present.
    ///
    /// # Errors
    ///
    /// Failures before any output exists are returned here. Once a
    /// [`ResponseEnvelope::Stream`] has been handed out, later failures only end the
    /// stream early.
    async fn invoke(
        &self,
        messages: &[Message],
        model: Option<&str>,
    ) -> Result<ResponseEnvelope, GatewayError>;

    /// Provider this adapter speaks to.
    fn provider(&self) -> Provider;
}

/// Thread-safe adapter handle.
pub type DynAdapter = Arc<dyn ProviderAdapter>;

/// Extracts the text fragment carried by one SSE `data:` payload.
pub(crate) type FragmentExtractor = fn(&str) -> Result<String, GatewayError>;

/// Maps decoded SSE events onto text fragments.
///
/// The stream ends on `[DONE]`, on end of body, or on the first decode or
/// transport error. Errors are logged, never forwarded: text already delivered
/// to the consumer stands.
pub(crate) fn fragment_stream(
    decoder: SseDecoder,
    provider: Provider,
    extract: FragmentExtractor,
) -> FragmentStream {
    let fragments = stream::unfold(Some(decoder), move |state| async move {
        let mut decoder = state?;
        match decoder.next().await? {
            Ok(SseEvent::Data(data)) => match extract(&data) {
                Ok(text) => Some((Some(text.into_bytes()), Some(decoder))),
                Err(err) => {
                    tracing::warn!(%provider, error = %err, "dropping stream after bad chunk");
                    Some((None, None))
                }
            },
            Ok(SseEvent::Done) => None,
            Err(err) => {
                tracing::warn!(%provider, error = %err, "upstream stream interrupted");
                Some((None, None))
            }
        }
    })
    .filter_map(future::ready);
    Box::pin(fragments)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use futures_util::stream;
    use parking_lot::Mutex;

    use crate::error::GatewayError;
    use crate::http::{HttpBodyStream, HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport};

    /// Transport that replays canned responses and records every request.
    pub(crate) struct ScriptedTransport {
        status: u16,
        chunks: Vec<Result<Vec<u8>, GatewayError>>,
        pub(crate) requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(status: u16, chunks: Vec<&str>) -> Self {
            Self {
                status,
                chunks: chunks
                    .into_iter()
                    .map(|chunk| Ok(chunk.as_bytes().to_vec()))
                    .collect(),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Appends a transport failure after the scripted chunks.
        pub(crate) fn failing_after(mut self, message: &str) -> Self {
            self.chunks.push(Err(GatewayError::transport(message)));
            self
        }

        pub(crate) fn last_body(&self) -> serde_json::Value {
            let requests = self.requests.lock();
            let request = requests.last().expect("a request was sent");
            serde_json::from_slice(&request.body).expect("json body")
        }

        pub(crate) fn last_request(&self) -> HttpRequest {
            self.requests.lock().last().cloned().expect("a request was sent")
        }

        fn replay(&self) -> Vec<Result<Vec<u8>, GatewayError>> {
            self.chunks
                .iter()
                .map(|chunk| match chunk {
                    Ok(bytes) => Ok(bytes.clone()),
                    Err(err) => Err(GatewayError::transport(err.to_string())),
                })
                .collect()
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, GatewayError> {
            self.requests.lock().push(request);
            let mut body = Vec::new();
            for chunk in self.replay() {
                body.extend_from_slice(&chunk?);
            }
            Ok(HttpResponse {
                status: self.status,
                headers: HashMap::new(),
                body,
            })
        }

        async fn send_stream(
            &self,
            request: HttpRequest,
        ) -> Result<HttpStreamResponse, GatewayError> {
            self.requests.lock().push(request);
            let body: HttpBodyStream = Box::pin(stream::iter(self.replay()));
            Ok(HttpStreamResponse {
                status: self.status,
                headers: HashMap::new(),
                body,
            })
        }
    }
}
