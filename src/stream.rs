use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;

use crate::error::GatewayError;
use crate::http::HttpBodyStream;
use crate::types::Provider;

/// Event yielded by [`SseDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Joined `data:` payload of one event.
    Data(String),
    /// OpenAI-style `[DONE]` terminator.
    Done,
}

/// Turns a raw HTTP body into Server-Sent Events.
///
/// Events may be split across arbitrary body chunk boundaries. Only `data:`
/// fields are kept; comments, `event:` and `id:` lines are ignored. Nothing
/// after a `[DONE]` event is decoded.
pub struct SseDecoder {
    body: HttpBodyStream,
    provider: Provider,
    /// Bytes after the last newline seen so far.
    partial: Vec<u8>,
    /// `data:` payload of the event being assembled.
    data: Option<Vec<u8>>,
    ready: VecDeque<Result<SseEvent, GatewayError>>,
    body_finished: bool,
    done: bool,
}

impl SseDecoder {
    pub fn new(body: HttpBodyStream, provider: Provider) -> Self {
        Self {
            body,
            provider,
            partial: Vec::new(),
            data: None,
            ready: VecDeque::new(),
            body_finished: false,
            done: false,
        }
    }

    /// Consumes one body chunk, queueing every event it completes.
    fn feed(&mut self, chunk: &[u8]) {
        let mut buffered = std::mem::take(&mut self.partial);
        buffered.extend_from_slice(chunk);
        let mut lines: Vec<&[u8]> = buffered.split(|byte| *byte == b'\n').collect();
        let rest = lines.pop().unwrap_or_default().to_vec();
        for line in lines {
            self.line(line.strip_suffix(b"\r").unwrap_or(line));
        }
        self.partial = rest;
    }

    /// Treats a body without a trailing blank line as one last event.
    fn finish(&mut self) {
        let rest = std::mem::take(&mut self.partial);
        if !rest.is_empty() {
            self.line(rest.strip_suffix(b"\r").unwrap_or(rest.as_slice()));
        }
        self.dispatch();
    }

    fn line(&mut self, line: &[u8]) {
        if self.done {
            return;
        }
        if line.is_empty() {
            self.dispatch();
            return;
        }
        let Some(value) = line.strip_prefix(b"data:") else {
            return;
        };
        let value = value.strip_prefix(b" ").unwrap_or(value);
        match &mut self.data {
            Some(data) => {
                data.push(b'\n');
                data.extend_from_slice(value);
            }
            None => self.data = Some(value.to_vec()),
        }
    }

    fn dispatch(&mut self) {
        let Some(data) = self.data.take().filter(|data| !data.is_empty()) else {
            return;
        };
        match String::from_utf8(data) {
            Ok(text) if text.trim() == "[DONE]" => {
                self.done = true;
                self.ready.push_back(Ok(SseEvent::Done));
            }
            Ok(text) => self.ready.push_back(Ok(SseEvent::Data(text))),
            Err(err) => self.ready.push_back(Err(GatewayError::upstream(
                self.provider,
                format!("invalid UTF-8 in stream chunk: {err}"),
            ))),
        }
    }
}

impl Stream for SseDecoder {
    type Item = Result<SseEvent, GatewayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.ready.pop_front() {
                return Poll::Ready(Some(event));
            }
            if this.done || this.body_finished {
                return Poll::Ready(None);
            }
            match this.body.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.feed(&chunk),
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => {
                    this.body_finished = true;
                    this.finish();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use futures_util::stream;

    use super::*;

    fn build_body(chunks: Vec<Result<Vec<u8>, GatewayError>>) -> HttpBodyStream {
        Box::pin(stream::iter(chunks))
    }

    #[tokio::test]
    async fn decoder_emits_data_and_done_events() {
        let chunks = vec![
            Ok(b"data: {\"text\":\"hi\"}\n\n".to_vec()),
            Ok(b"data: [DONE]\n\n".to_vec()),
        ];
        let mut decoder = SseDecoder::new(build_body(chunks), Provider::OpenAi);

        let first = decoder.next().await.expect("event").expect("ok");
        assert_eq!(first, SseEvent::Data("{\"text\":\"hi\"}".to_string()));

        let second = decoder.next().await.expect("event").expect("ok");
        assert_eq!(second, SseEvent::Done);

        assert!(decoder.next().await.is_none());
    }

    #[tokio::test]
    async fn decoder_reassembles_events_split_across_chunks() {
        let chunks = vec![
            Ok(b"data: {\"a\"".to_vec()),
            Ok(b":1}\r\n".to_vec()),
            Ok(b"\r\ndata: {\"b\":2}\n".to_vec()),
            Ok(b"\n".to_vec()),
        ];
        let mut decoder = SseDecoder::new(build_body(chunks), Provider::Google);
        let events: Vec<_> = decoder
            .by_ref()
            .map(|event| event.expect("ok"))
            .collect()
            .await;
        assert_eq!(
            events,
            vec![
                SseEvent::Data("{\"a\":1}".to_string()),
                SseEvent::Data("{\"b\":2}".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn decoder_combines_multiline_payloads() {
        let chunks = vec![
            Ok(b": keep-alive\n".to_vec()),
            Ok(b"data: line one\n".to_vec()),
            Ok(b"data: line two\n\n".to_vec()),
        ];
        let mut decoder = SseDecoder::new(build_body(chunks), Provider::OpenAi);
        let event = decoder.next().await.expect("event").expect("ok");
        assert_eq!(event, SseEvent::Data("line one\nline two".to_string()));
        assert!(decoder.next().await.is_none());
    }

    #[tokio::test]
    async fn decoder_flushes_trailing_event_without_blank_line() {
        let chunks = vec![Ok(b"data: tail".to_vec())];
        let mut decoder = SseDecoder::new(build_body(chunks), Provider::Google);
        let event = decoder.next().await.expect("event").expect("ok");
        assert_eq!(event, SseEvent::Data("tail".to_string()));
        assert!(decoder.next().await.is_none());
    }

    #[tokio::test]
    async fn decoder_ignores_everything_after_done() {
        let chunks = vec![Ok(b"data: [DONE]\n\ndata: late\n\n".to_vec())];
        let mut decoder = SseDecoder::new(build_body(chunks), Provider::OpenAi);
        assert_eq!(decoder.next().await.expect("event").expect("ok"), SseEvent::Done);
        assert!(decoder.next().await.is_none());
    }

    #[tokio::test]
    async fn decoder_reports_utf8_errors() {
        let chunks = vec![Ok(b"data: \xff\n\n".to_vec())];
        let mut decoder = SseDecoder::new(build_body(chunks), Provider::OpenAi);
        let err = decoder.next().await.expect("event").unwrap_err();
        match err {
            GatewayError::Upstream { provider, .. } => assert_eq!(provider, Provider::OpenAi),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
