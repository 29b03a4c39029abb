use anyhow::Result;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::completion::{Completion, CompletionAccumulator, CompletionReason};
use crate::models::content::Content;

/// Streams a completion as messages-protocol events: `message_start`, one
/// content block per text run or tool call, `message_delta`, `message_stop`.
///
/// A delta whose kind or tool-call id differs from the open block closes it
/// and opens the next one; indexes never repeat. When the stream produced no
/// content at all, an empty text block is synthesized so clients always see
/// at least one block.
pub struct MessageStream<F>
where
    F: FnMut(&str, Value) -> Result<()>,
{
    sink: F,

    message_id: String,
    model: String,

    acc: CompletionAccumulator,

    block_index: i64,
    block_kind: Option<BlockKind>,
    tool_call_id: String,

    has_content: bool,
    output_tokens: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    ToolUse,
}

impl<F> MessageStream<F>
where
    F: FnMut(&str, Value) -> Result<()>,
{
    pub fn new(model: &str, sink: F) -> Self {
        Self {
            sink,
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            model: model.to_string(),
            acc: CompletionAccumulator::new(),
            block_index: -1,
            block_kind: None,
            tool_call_id: String::new(),
            has_content: false,
            output_tokens: 0,
        }
    }

    /// Emits `message_start`. Call once, before the first delta.
    pub fn start(&mut self) -> Result<()> {
        let event = json!({
            "type": "message_start",
            "message": {
                "id": self.message_id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": self.model,
                "usage": {"input_tokens": 0, "output_tokens": 0},
            },
        });

        (self.sink)("message_start", event)
    }

    pub fn add(&mut self, delta: &Completion) -> Result<()> {
        self.acc.add(delta);

        if !delta.model.is_empty() {
            self.model = delta.model.clone();
        }

        if let Some(usage) = &delta.usage {
            if usage.output_tokens > 0 {
                self.output_tokens = usage.output_tokens;
            }
        }

        let Some(message) = &delta.message else {
            return Ok(());
        };

        for content in &message.content {
            match content {
                Content::Text(text) if !text.text.is_empty() => {
                    self.ensure_text_block()?;
                    self.emit_text_delta(&text.text)?;
                }
                // Refusals have no block type of their own here; surface as text
                Content::Refusal(refusal) if !refusal.refusal.is_empty() => {
                    self.ensure_text_block()?;
                    self.emit_text_delta(&refusal.refusal)?;
                }
                Content::ToolCall(call) => {
                    let is_new = !call.id.is_empty() && call.id != self.tool_call_id;

                    if is_new {
                        self.close_block()?;

                        self.block_index += 1;
                        self.block_kind = Some(BlockKind::ToolUse);
                        self.tool_call_id = call.id.clone();
                        self.has_content = true;

                        let event = json!({
                            "type": "content_block_start",
                            "index": self.block_index,
                            "content_block": {
                                "type": "tool_use",
                                "id": self.tool_call_id,
                                "name": call.name,
                                "input": {},
                            },
                        });

                        (self.sink)("content_block_start", event)?;
                    }

                    if !call.arguments.is_empty() {
                        let event = json!({
                            "type": "content_block_delta",
                            "index": self.block_index,
                            "delta": {
                                "type": "input_json_delta",
                                "partial_json": call.arguments,
                            },
                        });

                        (self.sink)("content_block_delta", event)?;
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Closes any open block, emits `message_delta` and `message_stop`, and
    /// returns the accumulated completion.
    pub fn finish(&mut self) -> Result<Completion> {
        self.close_block()?;

        if !self.has_content {
            let event = json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""},
            });
            (self.sink)("content_block_start", event)?;

            let event = json!({"type": "content_block_stop", "index": 0});
            (self.sink)("content_block_stop", event)?;
        }

        let completion = self.acc.result();

        let stop_reason = completion
            .message
            .as_ref()
            .filter(|m| !m.tool_calls().is_empty())
            .map(|_| "tool_use")
            .unwrap_or_else(|| to_stop_reason(completion.reason));

        let event = json!({
            "type": "message_delta",
            "delta": {"stop_reason": stop_reason},
            "usage": {"output_tokens": self.output_tokens},
        });
        (self.sink)("message_delta", event)?;

        let event = json!({"type": "message_stop"});
        (self.sink)("message_stop", event)?;

        Ok(completion)
    }

    fn ensure_text_block(&mut self) -> Result<()> {
        if self.block_kind == Some(BlockKind::Text) {
            return Ok(());
        }

        self.close_block()?;

        self.block_index += 1;
        self.block_kind = Some(BlockKind::Text);
        self.has_content = true;

        let event = json!({
            "type": "content_block_start",
            "index": self.block_index,
            "content_block": {"type": "text", "text": ""},
        });

        (self.sink)("content_block_start", event)
    }

    fn emit_text_delta(&mut self, text: &str) -> Result<()> {
        let event = json!({
            "type": "content_block_delta",
            "index": self.block_index,
            "delta": {"type": "text_delta", "text": text},
        });

        (self.sink)("content_block_delta", event)
    }

    fn close_block(&mut self) -> Result<()> {
        if self.block_kind.is_none() {
            return Ok(());
        }

        let event = json!({"type": "content_block_stop", "index": self.block_index});
        (self.sink)("content_block_stop", event)?;

        self.block_kind = None;
        Ok(())
    }
}

/// Builds the single-shot (non-streaming) messages-protocol response body.
pub fn message(completion: &Completion, fallback_model: &str) -> Value {
    let mut content = Vec::new();
    let mut stop_reason = to_stop_reason(completion.reason);

    if let Some(message) = &completion.message {
        for item in &message.content {
            match item {
                Content::Text(text) => {
                    content.push(json!({"type": "text", "text": text.text}));
                }
                Content::Refusal(refusal) => {
                    content.push(json!({"type": "text", "text": refusal.refusal}));
                }
                Content::ToolCall(call) => {
                    stop_reason = "tool_use";

                    let input: Value =
                        serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));

                    content.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": input,
                    }));
                }
                _ => {}
            }
        }
    }

    let model = if completion.model.is_empty() {
        fallback_model
    } else {
        &completion.model
    };

    let mut result = json!({
        "id": format!("msg_{}", Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "content": content,
        "model": model,
        "stop_reason": stop_reason,
    });

    if let Some(usage) = &completion.usage {
        result["usage"] = json!({
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
        });
    }

    result
}

fn to_stop_reason(reason: Option<CompletionReason>) -> &'static str {
    match reason {
        Some(CompletionReason::Length) => "max_tokens",
        Some(CompletionReason::Tool) => "tool_use",
        Some(CompletionReason::Filter) => "refusal",
        _ => "end_turn",
    }
}
