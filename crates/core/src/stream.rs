use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::ToolCall;
use crate::provider::ProviderError;
use crate::usage::Usage;

/// Why the model stopped generating, normalized across vendors (each of
/// which spells this differently on the wire).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Cancelled,
    Unknown,
}

impl From<&str> for FinishReason {
    fn from(s: &str) -> Self {
        match s {
            "stop" | "end_turn" => FinishReason::Stop,
            "length" | "max_tokens" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            "tool_calls" | "tool_use" => FinishReason::ToolCalls,
            "error" => FinishReason::Error,
            "cancelled" => FinishReason::Cancelled,
            _ => FinishReason::Unknown,
        }
    }
}

/// The vendor-facing per-chunk shape a `Provider` implementation parses
/// its own wire format into before handing frames to a
/// [`StreamNormalizer`]. Mirrors how the underlying provider's own
/// streaming chunk is usually shaped: text deltas, a start/delta/complete
/// triple per tool call (so argument JSON fragments can be concatenated),
/// a trailing usage report, and a terminal stop reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireFrame {
    Text { text: String },
    ToolUseStart { index: usize, id: String, name: String },
    ToolUseInputDelta { index: usize, partial_json: String },
    ToolUseComplete { index: usize, tool_call: ToolCall },
    Usage { usage: Usage },
    Done { stop_reason: String },
}

/// The canonical, provider-independent event sequence the Agent Runner
/// consumes. Exactly one `Done` or `Error` ends a stream; everything
/// else may repeat any number of times in between.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta { text: String },
    ToolCallStart { index: usize, id: String, name: String },
    ToolCallArgumentDelta { index: usize, partial_json: String },
    ToolCallComplete { index: usize, tool_call: ToolCall },
    Usage { usage: Usage },
    Done { finish_reason: FinishReason },
    /// Terminal, non-recoverable framing failure (buffer overflow, a
    /// wire-level protocol violation) — unlike a malformed JSON data frame,
    /// which is logged and skipped, this ends the stream.
    Error { kind: String, detail: String },
}

/// Caps how much unparsed tool-argument JSON a single in-flight tool call
/// may accumulate before the normalizer gives up on it, so a provider that
/// never closes a tool call can't grow this unboundedly.
pub const MAX_TOOL_ARGUMENT_BUFFER_BYTES: usize = 10 * 1024 * 1024;

struct PendingToolCall {
    id: String,
    name: String,
    argument_buffer: String,
}

/// Reassembles a provider's raw SSE byte stream into the canonical
/// [`StreamEvent`] sequence. Holds state across calls to [`feed`], namely
/// any undelivered partial SSE frame and the in-progress argument buffer
/// for each tool call index currently being streamed. The normalizer does
/// no timing of its own — timeouts belong to the Tool Executor and Agent
/// Runner that drive it.
///
/// [`feed`]: StreamNormalizer::feed
pub struct StreamNormalizer {
    sse_buffer: String,
    pending_tool_calls: HashMap<usize, PendingToolCall>,
    /// Set once a terminal `Error` event has been emitted. No further
    /// frames are parsed after that — the stream is done for, one way or
    /// another.
    terminated: bool,
}

impl Default for StreamNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamNormalizer {
    pub fn new() -> Self {
        Self {
            sse_buffer: String::new(),
            pending_tool_calls: HashMap::new(),
            terminated: false,
        }
    }

    /// Feeds one raw chunk of SSE text (as received over the wire, not
    /// necessarily frame-aligned) and returns every canonical event it
    /// completed. A chunk that ends mid-frame leaves its remainder
    /// buffered for the next call.
    ///
    /// Never returns an error: a malformed JSON data frame is logged and
    /// skipped, and a buffer overflow is surfaced as a terminal
    /// `StreamEvent::Error` rather than aborting the caller's loop.
    pub fn feed(&mut self, raw_chunk: &str) -> Vec<StreamEvent> {
        if self.terminated {
            return Vec::new();
        }
        self.sse_buffer.push_str(raw_chunk);
        let mut events = Vec::new();

        while let Some(boundary) = self.sse_buffer.find("\n\n") {
            let frame = self.sse_buffer[..boundary].to_string();
            self.sse_buffer.drain(..boundary + 2);

            let Some(data) = extract_data_line(&frame) else {
                continue;
            };
            if data == "[DONE]" {
                events.push(StreamEvent::Done { finish_reason: FinishReason::Stop });
                continue;
            }

            let wire: WireFrame = match serde_json::from_str(&data) {
                Ok(wire) => wire,
                Err(e) => {
                    log::warn!("skipping malformed stream data frame: {e}");
                    continue;
                }
            };
            if let Some(event) = self.apply(wire) {
                let is_error = matches!(event, StreamEvent::Error { .. });
                events.push(event);
                if is_error {
                    self.terminated = true;
                    break;
                }
            }
        }

        events
    }

    fn apply(&mut self, frame: WireFrame) -> Option<StreamEvent> {
        match frame {
            WireFrame::Text { text } => Some(StreamEvent::TextDelta { text }),
            WireFrame::ToolUseStart { index, id, name } => {
                self.pending_tool_calls.insert(
                    index,
                    PendingToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        argument_buffer: String::new(),
                    },
                );
                Some(StreamEvent::ToolCallStart { index, id, name })
            }
            WireFrame::ToolUseInputDelta { index, partial_json } => {
                if let Some(pending) = self.pending_tool_calls.get_mut(&index) {
                    if pending.argument_buffer.len() + partial_json.len()
                        > MAX_TOOL_ARGUMENT_BUFFER_BYTES
                    {
                        log::warn!(
                            "tool call {index} argument buffer exceeded {MAX_TOOL_ARGUMENT_BUFFER_BYTES} bytes, terminating stream"
                        );
                        return Some(StreamEvent::Error {
                            kind: "buffer_overflow".into(),
                            detail: format!(
                                "tool call {index} argument buffer exceeded {MAX_TOOL_ARGUMENT_BUFFER_BYTES} bytes"
                            ),
                        });
                    }
                    pending.argument_buffer.push_str(&partial_json);
                }
                Some(StreamEvent::ToolCallArgumentDelta { index, partial_json })
            }
            WireFrame::ToolUseComplete { index, tool_call } => {
                self.pending_tool_calls.remove(&index);
                Some(StreamEvent::ToolCallComplete { index, tool_call })
            }
            WireFrame::Usage { usage } => Some(StreamEvent::Usage { usage }),
            WireFrame::Done { stop_reason } => Some(StreamEvent::Done {
                finish_reason: FinishReason::from(stop_reason.as_str()),
            }),
        }
    }

    /// Synthesizes `ToolCallComplete` events for any tool call that never
    /// received an explicit completion frame, by parsing its accumulated
    /// argument buffer as JSON. Call this once the underlying stream ends,
    /// before treating a `Done` event as final.
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>, ProviderError> {
        if self.terminated {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        for (index, pending) in self.pending_tool_calls.drain() {
            let arguments: Value = if pending.argument_buffer.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&pending.argument_buffer).map_err(|e| {
                    ProviderError::Parse(format!(
                        "tool call {index} arguments did not form valid JSON: {e}"
                    ))
                })?
            };
            events.push(StreamEvent::ToolCallComplete {
                index,
                tool_call: ToolCall::new(pending.id, pending.name, arguments),
            });
        }
        Ok(events)
    }
}

fn extract_data_line(frame: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("data: ") {
            data_lines.push(rest);
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest);
        }
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}
