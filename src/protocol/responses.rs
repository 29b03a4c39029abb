use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::completion::{Completion, CompletionAccumulator};
use crate::models::content::Content;

/// Streams a completion as responses-protocol events.
///
/// Every event carries a monotonically increasing sequence number. Each
/// logical output element (the message text, each function call) is one
/// stable-id item emitting added, then deltas, then done. The terminal
/// `response.completed` carries the output array rebuilt from the
/// accumulator's final result rather than from replayed deltas, so a
/// content-less final chunk never double-counts.
pub struct ResponseStream<F>
where
    F: FnMut(&str, Value) -> Result<()>,
{
    sink: F,

    response_id: String,
    message_id: String,
    model: String,
    created_at: i64,

    acc: CompletionAccumulator,
    seq: u64,

    text_started: bool,
    text: String,

    call: Option<OpenCall>,
    next_output_index: u64,
}

struct OpenCall {
    id: String,
    name: String,
    arguments: String,
    output_index: u64,
}

impl<F> ResponseStream<F>
where
    F: FnMut(&str, Value) -> Result<()>,
{
    pub fn new(model: &str, sink: F) -> Self {
        Self {
            sink,
            response_id: format!("resp_{}", Uuid::new_v4().simple()),
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            model: model.to_string(),
            created_at: Utc::now().timestamp(),
            acc: CompletionAccumulator::new(),
            seq: 0,
            text_started: false,
            text: String::new(),
            call: None,
            next_output_index: 0,
        }
    }

    /// Emits `response.created` and `response.in_progress`. Call once,
    /// before the first delta.
    pub fn start(&mut self) -> Result<()> {
        let response = self.response_body("in_progress", json!([]));
        self.emit("response.created", json!({"response": response}))?;

        let response = self.response_body("in_progress", json!([]));
        self.emit("response.in_progress", json!({"response": response}))
    }

    pub fn add(&mut self, delta: &Completion) -> Result<()> {
        self.acc.add(delta);

        if !delta.model.is_empty() {
            self.model = delta.model.clone();
        }

        let Some(message) = &delta.message else {
            return Ok(());
        };

        for content in message.content.clone() {
            match content {
                Content::Text(text) if !text.text.is_empty() => {
                    self.ensure_text_item()?;

                    self.text.push_str(&text.text);

                    let event = json!({
                        "item_id": self.message_id,
                        "output_index": 0,
                        "content_index": 0,
                        "delta": text.text,
                    });
                    self.emit("response.output_text.delta", event)?;
                }
                Content::ToolCall(call) => {
                    if !call.id.is_empty()
                        && self.call.as_ref().map(|c| c.id.as_str()) != Some(call.id.as_str())
                    {
                        self.close_call()?;

                        let output_index = self.next_output_index;
                        self.next_output_index += 1;

                        let event = json!({
                            "output_index": output_index,
                            "item": {
                                "id": call.id,
                                "type": "function_call",
                                "status": "in_progress",
                                "call_id": call.id,
                                "name": call.name,
                                "arguments": "",
                            },
                        });
                        self.emit("response.output_item.added", event)?;

                        self.call = Some(OpenCall {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            arguments: String::new(),
                            output_index,
                        });
                    }

                    if call.arguments.is_empty() {
                        continue;
                    }

                    let Some(open) = &mut self.call else {
                        continue;
                    };

                    open.arguments.push_str(&call.arguments);

                    let (item_id, output_index) = (open.id.clone(), open.output_index);

                    let event = json!({
                        "item_id": item_id,
                        "output_index": output_index,
                        "delta": call.arguments,
                    });
                    self.emit("response.function_call_arguments.delta", event)?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Closes open items, emits `response.completed`, and returns the
    /// accumulated completion.
    pub fn finish(&mut self) -> Result<Completion> {
        self.close_call()?;

        if self.text_started {
            let text = self.text.clone();

            let event = json!({
                "item_id": self.message_id,
                "output_index": 0,
                "content_index": 0,
                "text": text,
            });
            self.emit("response.output_text.done", event)?;

            let event = json!({
                "item_id": self.message_id,
                "output_index": 0,
                "content_index": 0,
                "part": {"type": "output_text", "text": self.text.clone()},
            });
            self.emit("response.content_part.done", event)?;

            let event = json!({
                "output_index": 0,
                "item": {
                    "id": self.message_id,
                    "type": "message",
                    "status": "completed",
                    "role": "assistant",
                    "content": [{"type": "output_text", "text": self.text.clone()}],
                },
            });
            self.emit("response.output_item.done", event)?;
        }

        let completion = self.acc.result();

        let mut output = Vec::new();

        if let Some(message) = &completion.message {
            // Function calls come first in the output array
            for call in message.tool_calls() {
                output.push(json!({
                    "id": call.id,
                    "type": "function_call",
                    "status": "completed",
                    "call_id": call.id,
                    "name": call.name,
                    "arguments": call.arguments,
                }));
            }

            let text = message.text();

            if !text.is_empty() {
                output.push(json!({
                    "id": self.message_id,
                    "type": "message",
                    "status": "completed",
                    "role": "assistant",
                    "content": [{"type": "output_text", "text": text}],
                }));
            }
        }

        let mut response = self.response_body("completed", json!(output));

        if let Some(usage) = &completion.usage {
            response["usage"] = json!({
                "input_tokens": usage.input_tokens,
                "output_tokens": usage.output_tokens,
                "total_tokens": usage.total(),
            });
        }

        self.emit("response.completed", json!({"response": response}))?;

        Ok(completion)
    }

    /// Emits `response.failed` for an errored completion.
    pub fn fail(&mut self, error: &anyhow::Error) -> Result<()> {
        let mut response = self.response_body("failed", json!([]));

        response["error"] = json!({
            "code": "server_error",
            "message": error.to_string(),
        });

        self.emit("response.failed", json!({"response": response}))
    }

    fn ensure_text_item(&mut self) -> Result<()> {
        if self.text_started {
            return Ok(());
        }

        self.text_started = true;
        self.next_output_index = self.next_output_index.max(1);

        let event = json!({
            "output_index": 0,
            "item": {
                "id": self.message_id,
                "type": "message",
                "status": "in_progress",
                "role": "assistant",
                "content": [],
            },
        });
        self.emit("response.output_item.added", event)?;

        let event = json!({
            "item_id": self.message_id,
            "output_index": 0,
            "content_index": 0,
            "part": {"type": "output_text", "text": ""},
        });
        self.emit("response.content_part.added", event)
    }

    fn close_call(&mut self) -> Result<()> {
        let Some(open) = self.call.take() else {
            return Ok(());
        };

        let event = json!({
            "item_id": open.id,
            "output_index": open.output_index,
            "name": open.name,
            "arguments": open.arguments,
        });
        self.emit("response.function_call_arguments.done", event)?;

        let event = json!({
            "output_index": open.output_index,
            "item": {
                "id": open.id,
                "type": "function_call",
                "status": "completed",
                "call_id": open.id,
                "name": open.name,
                "arguments": open.arguments,
            },
        });
        self.emit("response.output_item.done", event)
    }

    fn response_body(&self, status: &str, output: Value) -> Value {
        json!({
            "id": self.response_id,
            "object": "response",
            "created_at": self.created_at,
            "status": status,
            "model": self.model,
            "output": output,
        })
    }

    fn emit(&mut self, name: &str, mut event: Value) -> Result<()> {
        event["type"] = json!(name);
        event["sequence_number"] = json!(self.seq);
        self.seq += 1;

        (self.sink)(name, event)
    }
}

/// Builds the single-shot responses-protocol body.
pub fn response(completion: &Completion, fallback_model: &str) -> Value {
    let model = if completion.model.is_empty() {
        fallback_model
    } else {
        &completion.model
    };

    let mut output = Vec::new();

    if let Some(message) = &completion.message {
        for call in message.tool_calls() {
            output.push(json!({
                "id": call.id,
                "type": "function_call",
                "status": "completed",
                "call_id": call.id,
                "name": call.name,
                "arguments": call.arguments,
            }));
        }

        let text = message.text();

        if !text.is_empty() {
            output.push(json!({
                "type": "message",
                "status": "completed",
                "role": "assistant",
                "content": [{"type": "output_text", "text": text}],
            }));
        }
    }

    let mut result = json!({
        "id": completion.id,
        "object": "response",
        "created_at": Utc::now().timestamp(),
        "status": "completed",
        "model": model,
        "output": output,
    });

    if let Some(usage) = &completion.usage {
        result["usage"] = json!({
            "input_tokens": usage.input_tokens,
            "output_tokens": usage.output_tokens,
            "total_tokens": usage.total(),
        });
    }

    result
}
