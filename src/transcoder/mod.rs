//! OpenAI streaming chunks → Anthropic SSE events
//!
//! # Event Mapping (OpenAI → Anthropic)
//! - first chunk → `message_start` + `ping`
//! - `delta.content` → `content_block_start` (text, once) + `text_delta`
//! - `delta.tool_calls[i]` → `content_block_start` (tool_use, once per call
//!   id; fragments without an id belong to the latest call at `i`) +
//!   `input_json_delta` for every argument fragment
//! - `finish_reason` → `content_block_stop` for every open block, ascending
//! - end of upstream → `message_delta` (stop reason, usage) + `message_stop`
//!
//! Blocks stay open until the finish reason or the end of the stream, so a
//! failing upstream can always be answered with a close for every open block
//! followed by one terminal `error` event.

mod relay;

pub use relay::{relay, RelayOutcome};

use crate::converter::{map_finish_reason, parse_arguments};
use crate::models::openai::{OpenAIStreamChunk, OpenAIToolCallDelta};
use crate::models::{
    BlockDelta, ContentBlock, DeltaUsage, ErrorBody, MessageDeltaBody, MessagesResponse, StopReason, StreamEvent,
    Usage,
};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nothing emitted yet
    Pending,
    /// `message_start` sent, blocks may open
    Streaming,
    /// Finish reason received, all blocks closed; waiting for usage / end
    Finishing,
    /// Terminal event sent
    Done,
}

#[derive(Debug)]
enum BlockKind {
    Text,
    ToolUse { id: String, name: String },
}

#[derive(Debug)]
struct OpenBlock {
    kind: BlockKind,
    /// Accumulated text, or raw tool arguments in arrival order
    buffer: String,
}

/// Per-request streaming state
#[derive(Debug, Default)]
struct StreamState {
    open: BTreeMap<usize, OpenBlock>,
    text_block: Option<usize>,
    /// upstream tool call id → block index
    tool_ids: HashMap<String, usize>,
    /// upstream tool call index → latest block opened at that index
    tool_blocks: HashMap<u32, usize>,
    next_index: usize,
    stop_reason: Option<StopReason>,
    usage: Usage,
    completed: BTreeMap<usize, ContentBlock>,
    failure: Option<String>,
}

/// Stateful transcoder for one upstream stream.
///
/// Owned by the single task relaying one client connection; never shared.
#[derive(Debug)]
pub struct StreamTranscoder {
    message_id: String,
    model: String,
    phase: Phase,
    state: StreamState,
}

impl StreamTranscoder {
    /// `model` is echoed to the client in `message_start`
    pub fn new(message_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            phase: Phase::Pending,
            state: StreamState::default(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Terminal error message, if the stream ended in failure
    pub fn failure(&self) -> Option<&str> {
        self.state.failure.as_deref()
    }

    pub fn usage(&self) -> Usage {
        self.state.usage
    }

    /// Blocks closed so far, in index order, with tool inputs parsed
    pub fn completed_blocks(&self) -> Vec<ContentBlock> {
        self.state.completed.values().cloned().collect()
    }

    /// Assemble the streamed message, for logging
    pub fn to_response(&self) -> MessagesResponse {
        let mut message = MessagesResponse::empty(self.message_id.clone(), self.model.clone());
        message.content = self.completed_blocks();
        message.stop_reason = self.state.stop_reason;
        message.usage = self.state.usage;
        message
    }

    /// Consume one upstream chunk
    pub fn push(&mut self, chunk: &OpenAIStreamChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if self.phase == Phase::Done {
            tracing::warn!("Ignoring upstream chunk after stream end");
            return events;
        }

        self.ensure_started(&mut events);

        if let Some(usage) = chunk.usage {
            self.state.usage = Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
        }

        // Only the first choice is relayed
        for choice in chunk.choices.iter().filter(|c| c.index == 0) {
            if self.phase == Phase::Finishing {
                if choice.delta.content.is_some() || choice.delta.tool_calls.is_some() {
                    tracing::warn!("Ignoring content delta after finish_reason");
                }
                continue;
            }

            if let Some(text) = choice.delta.content.as_deref().filter(|t| !t.is_empty()) {
                let index = self.text_block(&mut events);
                if let Some(block) = self.state.open.get_mut(&index) {
                    block.buffer.push_str(text);
                }
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::TextDelta { text: text.to_string() },
                });
            }

            for tool_call in choice.delta.tool_calls.iter().flatten() {
                self.tool_fragment(tool_call, &mut events);
            }

            if let Some(reason) = &choice.finish_reason {
                self.state.stop_reason = Some(map_finish_reason(reason));
                self.close_all(true, &mut events);
                if self.phase == Phase::Done {
                    return events;
                }
                self.phase = Phase::Finishing;
            }
        }

        events
    }

    /// Upstream ended cleanly (EOF or `[DONE]`)
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.phase == Phase::Done {
            return events;
        }

        self.ensure_started(&mut events);

        if self.phase == Phase::Streaming {
            self.close_all(true, &mut events);
            if self.phase == Phase::Done {
                return events;
            }
        }

        let stop_reason = self.state.stop_reason.unwrap_or_else(|| {
            tracing::warn!("Stream ended without finish_reason, reporting end_turn");
            StopReason::EndTurn
        });
        self.state.stop_reason = Some(stop_reason);

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                output_tokens: self.state.usage.output_tokens,
            },
        });
        events.push(StreamEvent::MessageStop);
        self.phase = Phase::Done;
        events
    }

    /// Upstream transport failed mid-stream: close every open block, then
    /// terminate with an `error` event.
    pub fn fail(&mut self, message: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.phase == Phase::Done {
            return events;
        }

        self.ensure_started(&mut events);
        self.close_all(false, &mut events);
        if self.phase != Phase::Done {
            self.terminate_with_error(format!("upstream stream failed: {}", message), &mut events);
        }
        events
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if self.phase != Phase::Pending {
            return;
        }
        events.push(StreamEvent::MessageStart {
            message: MessagesResponse::empty(self.message_id.clone(), self.model.clone()),
        });
        events.push(StreamEvent::Ping);
        self.phase = Phase::Streaming;
    }

    fn text_block(&mut self, events: &mut Vec<StreamEvent>) -> usize {
        if let Some(index) = self.state.text_block {
            return index;
        }
        let index = self.open_block(BlockKind::Text, events);
        self.state.text_block = Some(index);
        index
    }

    fn tool_fragment(&mut self, tool_call: &OpenAIToolCallDelta, events: &mut Vec<StreamEvent>) {
        let function = tool_call.function.as_ref();

        let call_id = tool_call.id.as_deref().filter(|id| !id.is_empty());
        let existing = match call_id {
            Some(id) => self.state.tool_ids.get(id),
            None => self.state.tool_blocks.get(&tool_call.index),
        };

        let index = match existing {
            Some(&index) => index,
            None => {
                let id = call_id
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                let name = function.and_then(|f| f.name.clone()).unwrap_or_default();
                if name.is_empty() {
                    tracing::warn!("Tool call {} started without a function name", id);
                }
                tracing::debug!("🔧 Tool start: {} (id: {})", name, id);

                let index = self.open_block(BlockKind::ToolUse { id: id.clone(), name }, events);
                self.state.tool_ids.insert(id, index);
                self.state.tool_blocks.insert(tool_call.index, index);
                index
            }
        };

        let Some(arguments) = function.and_then(|f| f.arguments.as_deref()).filter(|a| !a.is_empty()) else {
            return;
        };

        if let Some(block) = self.state.open.get_mut(&index) {
            block.buffer.push_str(arguments);
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::InputJsonDelta {
                    partial_json: arguments.to_string(),
                },
            });
        }
    }

    fn open_block(&mut self, kind: BlockKind, events: &mut Vec<StreamEvent>) -> usize {
        let index = self.state.next_index;
        self.state.next_index += 1;

        let content_block = match &kind {
            BlockKind::Text => ContentBlock::text(""),
            BlockKind::ToolUse { id, name } => ContentBlock::tool_use(id.clone(), name.clone(), serde_json::json!({})),
        };
        events.push(StreamEvent::ContentBlockStart { index, content_block });
        self.state.open.insert(index, OpenBlock { kind, buffer: String::new() });
        index
    }

    /// Close every open block in ascending index order.
    ///
    /// With `parse`, tool argument buffers are parsed first; a malformed buffer
    /// is not closed and the stream terminates with an error once the other
    /// blocks are closed.
    fn close_all(&mut self, parse: bool, events: &mut Vec<StreamEvent>) {
        let mut malformed = None;

        while let Some((index, block)) = self.state.open.pop_first() {
            let completed = match block.kind {
                BlockKind::Text => Some(ContentBlock::Text { text: block.buffer }),
                BlockKind::ToolUse { id, name } => {
                    match parse_arguments(&id, &block.buffer) {
                        Ok(input) => Some(ContentBlock::ToolUse { id, name, input }),
                        Err(e) if parse => {
                            tracing::error!("Tool call arguments did not parse at block close: {}", e);
                            malformed.get_or_insert(e.to_string());
                            continue;
                        }
                        Err(_) => None,
                    }
                }
            };

            if let Some(completed) = completed {
                self.state.completed.insert(index, completed);
            }
            events.push(StreamEvent::ContentBlockStop { index });
        }

        if let Some(message) = malformed {
            self.terminate_with_error(message, events);
        }
    }

    fn terminate_with_error(&mut self, message: String, events: &mut Vec<StreamEvent>) {
        events.push(StreamEvent::Error {
            error: ErrorBody {
                r#type: "api_error".to_string(),
                message: message.clone(),
            },
        });
        self.state.failure = Some(message);
        self.phase = Phase::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::openai::OpenAIUsage;
    use serde_json::json;

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.event_name()).collect()
    }

    fn run(transcoder: &mut StreamTranscoder, chunks: &[OpenAIStreamChunk]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(transcoder.push(chunk));
        }
        events.extend(transcoder.finish());
        events
    }

    #[test]
    fn test_text_stream() {
        let mut transcoder = StreamTranscoder::new("msg_1", "claude-sonnet");
        let events = run(
            &mut transcoder,
            &[
                OpenAIStreamChunk::text("Hel"),
                OpenAIStreamChunk::text("lo"),
                OpenAIStreamChunk::finish("stop"),
            ],
        );

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        match &events[0] {
            StreamEvent::MessageStart { message } => {
                assert_eq!(message.id, "msg_1");
                assert_eq!(message.model, "claude-sonnet");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(transcoder.completed_blocks(), vec![ContentBlock::text("Hello")]);
        assert!(transcoder.is_done());
    }

    #[test]
    fn test_parallel_calls_sharing_an_index_get_separate_blocks() {
        let mut transcoder = StreamTranscoder::new("msg_1", "m");
        let events = run(
            &mut transcoder,
            &[
                OpenAIStreamChunk::tool_call(0, Some("call_a"), Some("ls"), Some(r#"{"a":1}"#)),
                OpenAIStreamChunk::tool_call(0, Some("call_b"), Some("pwd"), Some(r#"{"b":"#)),
                OpenAIStreamChunk::tool_call(0, None, None, Some("2}")),
                OpenAIStreamChunk::finish("tool_calls"),
            ],
        );

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert!(transcoder.failure().is_none());
        assert_eq!(
            transcoder.completed_blocks(),
            vec![
                ContentBlock::tool_use("call_a", "ls", json!({"a": 1})),
                ContentBlock::tool_use("call_b", "pwd", json!({"b": 2})),
            ]
        );
    }

    #[test]
    fn test_repeated_call_id_continues_its_block() {
        let mut transcoder = StreamTranscoder::new("msg_1", "m");
        run(
            &mut transcoder,
            &[
                OpenAIStreamChunk::tool_call(0, Some("call_a"), Some("ls"), Some(r#"{"dir""#)),
                OpenAIStreamChunk::tool_call(1, Some("call_b"), Some("pwd"), Some("{}")),
                OpenAIStreamChunk::tool_call(0, Some("call_a"), None, Some(r#":"/"}"#)),
                OpenAIStreamChunk::finish("tool_calls"),
            ],
        );

        assert_eq!(
            transcoder.completed_blocks(),
            vec![
                ContentBlock::tool_use("call_a", "ls", json!({"dir": "/"})),
                ContentBlock::tool_use("call_b", "pwd", json!({})),
            ]
        );
    }

    #[test]
    fn test_tool_arguments_parsed_once_at_close() {
        let mut transcoder = StreamTranscoder::new("msg_1", "m");
        let events = run(
            &mut transcoder,
            &[
                OpenAIStreamChunk::tool_call(0, Some("call_1"), Some("read"), Some("")),
                OpenAIStreamChunk::tool_call(0, None, None, Some(r#"{"pa"#)),
                OpenAIStreamChunk::tool_call(0, None, None, Some(r#"th":"/x"}"#)),
                OpenAIStreamChunk::finish("tool_calls"),
            ],
        );

        let deltas: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    delta: BlockDelta::InputJsonDelta { partial_json },
                    ..
                } => Some(partial_json.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec![r#"{"pa"#, r#"th":"/x"}"#]);

        assert_eq!(
            transcoder.completed_blocks(),
            vec![ContentBlock::tool_use("call_1", "read", json!({"path": "/x"}))]
        );
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::MessageDelta { delta: MessageDeltaBody { stop_reason: Some(StopReason::ToolUse), .. }, .. }
        )));
    }

    #[test]
    fn test_text_then_parallel_tools_get_distinct_indices() {
        let mut transcoder = StreamTranscoder::new("msg_1", "m");
        let events = run(
            &mut transcoder,
            &[
                OpenAIStreamChunk::text("Let me look."),
                OpenAIStreamChunk::tool_call(0, Some("call_a"), Some("ls"), Some("{}")),
                OpenAIStreamChunk::tool_call(1, Some("call_b"), Some("pwd"), Some("{}")),
                OpenAIStreamChunk::finish("tool_calls"),
            ],
        );

        let starts: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStart { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        let stops: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStop { index } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![0, 1, 2]);
        assert_eq!(stops, vec![0, 1, 2]);
    }

    #[test]
    fn test_transport_failure_closes_open_blocks_in_order() {
        let mut transcoder = StreamTranscoder::new("msg_1", "m");
        let mut events = Vec::new();
        events.extend(transcoder.push(&OpenAIStreamChunk::text("partial")));
        events.extend(transcoder.push(&OpenAIStreamChunk::tool_call(0, Some("call_1"), Some("read"), Some(r#"{"pa"#))));
        let tail = transcoder.fail("connection reset");

        assert_eq!(
            tail,
            vec![
                StreamEvent::ContentBlockStop { index: 0 },
                StreamEvent::ContentBlockStop { index: 1 },
                StreamEvent::Error {
                    error: ErrorBody {
                        r#type: "api_error".to_string(),
                        message: "upstream stream failed: connection reset".to_string(),
                    }
                },
            ]
        );
        assert!(transcoder.is_done());
        assert!(transcoder.finish().is_empty());
        assert!(transcoder.fail("again").is_empty());
    }

    #[test]
    fn test_failure_before_first_chunk_still_starts_message() {
        let mut transcoder = StreamTranscoder::new("msg_1", "m");
        let events = transcoder.fail("reset");
        assert_eq!(names(&events), vec!["message_start", "ping", "error"]);
    }

    #[test]
    fn test_malformed_arguments_terminate_with_error() {
        let mut transcoder = StreamTranscoder::new("msg_1", "m");
        let events = run(
            &mut transcoder,
            &[
                OpenAIStreamChunk::text("hi"),
                OpenAIStreamChunk::tool_call(0, Some("call_1"), Some("read"), Some(r#"{"path": "#)),
                OpenAIStreamChunk::finish("tool_calls"),
            ],
        );

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "error"
            ]
        );
        assert_eq!(events[6], StreamEvent::ContentBlockStop { index: 0 });
        assert!(transcoder.failure().unwrap().contains("call_1"));
    }

    #[test]
    fn test_missing_finish_reason_still_terminates() {
        let mut transcoder = StreamTranscoder::new("msg_1", "m");
        let events = run(&mut transcoder, &[OpenAIStreamChunk::text("cut off")]);
        assert_eq!(names(&events).last(), Some(&"message_stop"));
        assert!(events.contains(&StreamEvent::ContentBlockStop { index: 0 }));
    }

    #[test]
    fn test_empty_upstream_is_well_formed() {
        let mut transcoder = StreamTranscoder::new("msg_1", "m");
        let events = transcoder.finish();
        assert_eq!(names(&events), vec!["message_start", "ping", "message_delta", "message_stop"]);
    }

    #[test]
    fn test_usage_after_finish_reason_is_reported() {
        let mut transcoder = StreamTranscoder::new("msg_1", "m");
        let mut usage_chunk = OpenAIStreamChunk::default();
        usage_chunk.usage = Some(OpenAIUsage {
            prompt_tokens: 7,
            completion_tokens: 3,
        });

        let events = run(
            &mut transcoder,
            &[OpenAIStreamChunk::text("ok"), OpenAIStreamChunk::finish("length"), usage_chunk],
        );

        let delta = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::MessageDelta { delta, usage } => Some((delta.stop_reason, usage.output_tokens)),
                _ => None,
            })
            .unwrap();
        assert_eq!(delta, (Some(StopReason::MaxTokens), 3));
        assert_eq!(transcoder.usage().input_tokens, 7);
    }

    #[test]
    fn test_late_deltas_ignored() {
        let mut transcoder = StreamTranscoder::new("msg_1", "m");
        transcoder.push(&OpenAIStreamChunk::text("a"));
        transcoder.push(&OpenAIStreamChunk::finish("stop"));
        let late = transcoder.push(&OpenAIStreamChunk::text("b"));
        assert!(late.is_empty());
        assert_eq!(transcoder.completed_blocks(), vec![ContentBlock::text("a")]);
    }
}
