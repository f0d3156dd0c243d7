use super::error::ProviderError;
use super::ChunkStream;
use crate::models::openai::OpenAIStreamChunk;
use bytes::Bytes;
use futures::stream::{Stream, TryStreamExt};
use pin_project::pin_project;
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

/// Upstream end-of-stream sentinel
const DONE_SENTINEL: &str = "[DONE]";

/// SSE event from provider
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Parse SSE events from a complete chunk of text
pub fn parse_sse_events(input: &str) -> Vec<SseEvent> {
    let mut events = Vec::new();
    let mut current_event: Option<String> = None;
    let mut current_data = String::new();

    for line in input.lines() {
        if line.is_empty() {
            // Empty line marks end of event
            if !current_data.is_empty() {
                events.push(SseEvent {
                    event: current_event.take(),
                    data: std::mem::take(&mut current_data),
                });
            }
        } else if let Some(data) = line.strip_prefix("data:") {
            if !current_data.is_empty() {
                current_data.push('\n');
            }
            current_data.push_str(data.strip_prefix(' ').unwrap_or(data));
        } else if let Some(event) = line.strip_prefix("event:") {
            current_event = Some(event.trim_start().to_string());
        }
        // Ignore comments and other fields like "id:", "retry:", etc.
    }

    // Handle case where stream doesn't end with empty line
    if !current_data.is_empty() {
        events.push(SseEvent {
            event: current_event,
            data: current_data,
        });
    }

    events
}

/// Stream adapter that splits a byte stream into SSE events.
///
/// Bytes are buffered until a blank line completes an event, so events split
/// across network reads (or several events in one read) come out whole and in
/// order.
#[pin_project]
pub struct SseStream<S> {
    #[pin]
    inner: S,
    buffer: Vec<u8>,
    pending: VecDeque<SseEvent>,
    exhausted: bool,
}

impl<S> SseStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            exhausted: false,
        }
    }
}

fn find_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

impl<S, E> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<ProviderError>,
{
    type Item = Result<SseEvent, ProviderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if *this.exhausted {
                return Poll::Ready(None);
            }

            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => {
                    // CRLF framing is normalised to LF
                    this.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

                    while let Some(pos) = find_boundary(this.buffer) {
                        let raw: Vec<u8> = this.buffer.drain(..pos + 2).collect();
                        this.pending.extend(parse_sse_events(&String::from_utf8_lossy(&raw)));
                    }
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                None => {
                    // Stream ended - flush whatever is left in the buffer
                    *this.exhausted = true;
                    if !this.buffer.is_empty() {
                        let rest = std::mem::take(this.buffer);
                        this.pending.extend(parse_sse_events(&String::from_utf8_lossy(&rest)));
                    }
                }
            }
        }
    }
}

/// Mid-stream error payload some providers send instead of a chunk
#[derive(Debug, Deserialize)]
struct StreamErrorEnvelope {
    error: serde_json::Value,
}

fn decode_chunk(event: SseEvent) -> Result<OpenAIStreamChunk, ProviderError> {
    if let Some(envelope) = serde_json::from_str::<StreamErrorEnvelope>(&event.data)
        .ok()
        .filter(|e| !e.error.is_null())
    {
        let message = envelope
            .error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| envelope.error.to_string());
        return Err(ProviderError::Stream(message));
    }

    serde_json::from_str(&event.data).map_err(|e| {
        tracing::warn!("Failed to parse upstream chunk: {} - Data: {}", e, event.data);
        ProviderError::Stream(format!("unparseable chunk: {}", e))
    })
}

/// Decode an OpenAI-style SSE byte stream into typed chunks.
///
/// The stream ends at `[DONE]` or at upstream EOF, whichever comes first.
pub fn chunk_stream<S, E>(bytes: S) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<ProviderError> + 'static,
{
    let chunks = SseStream::new(bytes)
        .try_take_while(|event| futures::future::ready(Ok(event.data.trim() != DONE_SENTINEL)))
        .try_filter(|event| futures::future::ready(!event.data.trim().is_empty()))
        .and_then(|event| futures::future::ready(decode_chunk(event)));

    Box::pin(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn byte_stream(parts: &[&str]) -> impl Stream<Item = Result<Bytes, ProviderError>> + Send + 'static {
        let parts: Vec<Result<Bytes, ProviderError>> =
            parts.iter().map(|p| Ok(Bytes::from(p.to_string()))).collect();
        futures::stream::iter(parts)
    }

    #[test]
    fn test_parse_sse_single_event() {
        let input = "event: message\ndata: {\"test\":\"value\"}\n\n";
        let events = parse_sse_events(input);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"test\":\"value\"}");
    }

    #[test]
    fn test_parse_sse_no_event_type() {
        let input = "data: plain data\n\n: keep-alive\n\n";
        let events = parse_sse_events(input);

        assert_eq!(events.len(), 1);
        assert!(events[0].event.is_none());
        assert_eq!(events[0].data, "plain data");
    }

    #[tokio::test]
    async fn test_events_split_across_reads() {
        let stream = SseStream::new(byte_stream(&["data: {\"a\"", ":1}\n", "\ndata: {\"b\":2}\n\ndata: x\n\n"]));
        let events: Vec<SseEvent> = stream.try_collect().await.unwrap();

        let data: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["{\"a\":1}", "{\"b\":2}", "x"]);
    }

    #[test]
    fn test_partial_event_waits_for_more_bytes() {
        use tokio_test::{assert_pending, assert_ready};

        let bytes = byte_stream(&["data: {\"a\":1}\n\ndata: {\"b\""]).chain(futures::stream::pending());
        let mut stream = tokio_test::task::spawn(SseStream::new(bytes));

        let first = assert_ready!(stream.poll_next());
        assert_eq!(first.unwrap().unwrap().data, "{\"a\":1}");
        assert_pending!(stream.poll_next());
    }

    #[tokio::test]
    async fn test_crlf_framing() {
        let stream = SseStream::new(byte_stream(&["data: one\r\n\r\ndata: two\r\n\r\n"]));
        let events: Vec<SseEvent> = stream.try_collect().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data, "two");
    }

    #[tokio::test]
    async fn test_chunk_stream_stops_at_done() {
        let body = concat!(
            "data: {\"id\":\"c1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"id\":\"late\",\"choices\":[]}\n\n",
        );
        let chunks: Vec<OpenAIStreamChunk> = chunk_stream(byte_stream(&[body])).try_collect().await.unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("Hi"));
    }

    #[tokio::test]
    async fn test_chunk_stream_surfaces_upstream_error_payload() {
        let body = "data: {\"error\":{\"message\":\"overloaded\"}}\n\n";
        let mut chunks = chunk_stream(byte_stream(&[body]));

        match chunks.next().await {
            Some(Err(ProviderError::Stream(message))) => assert_eq!(message, "overloaded"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_error_passes_through() {
        let parts: Vec<Result<Bytes, ProviderError>> = vec![
            Ok(Bytes::from("data: {\"choices\":[]}\n\n")),
            Err(ProviderError::Connection("reset".to_string())),
        ];
        let mut chunks = chunk_stream(futures::stream::iter(parts));

        assert!(chunks.next().await.unwrap().is_ok());
        assert!(matches!(chunks.next().await, Some(Err(ProviderError::Connection(_)))));
    }
}
