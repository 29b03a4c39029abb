use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::models::completion::{Completion, CompletionAccumulator, CompletionReason, Usage};
use crate::models::content::Content;
use crate::models::message::Message;

/// Streams a completion as chat-protocol chunks.
///
/// Tool-call deltas carry a stable position per call id, assigned in
/// first-seen order, so clients can merge argument fragments positionally
/// even when continuation deltas elide the id. The role is emitted on the
/// first chunk only; usage-only deltas are suppressed mid-stream and
/// surfaced by `finish`.
pub struct ChunkStream<F>
where
    F: FnMut(Value) -> Result<()>,
{
    sink: F,

    model: String,

    acc: CompletionAccumulator,

    role_sent: bool,
    reason: Option<CompletionReason>,

    call_index: HashMap<String, usize>,
    last_call_id: String,
}

impl<F> ChunkStream<F>
where
    F: FnMut(Value) -> Result<()>,
{
    pub fn new(model: &str, sink: F) -> Self {
        Self {
            sink,
            model: model.to_string(),
            acc: CompletionAccumulator::new(),
            role_sent: false,
            reason: None,
            call_index: HashMap::new(),
            last_call_id: String::new(),
        }
    }

    pub fn add(&mut self, delta: &Completion) -> Result<()> {
        self.acc.add(delta);

        if let Some(reason) = delta.reason {
            self.reason = Some(reason);
        }

        // Usage arrives on content-less deltas; it is reported once at finish
        let has_content = delta
            .message
            .as_ref()
            .is_some_and(|m| !m.content.is_empty());

        if delta.usage.is_some() && !has_content {
            return Ok(());
        }

        let Some(message) = &delta.message else {
            return Ok(());
        };

        let mut entry = json!({});

        if !self.role_sent {
            self.role_sent = true;
            entry["role"] = json!("assistant");
        }

        let text = message.text();

        if !text.is_empty() {
            entry["content"] = json!(text);
        }

        let mut calls = Vec::new();

        for content in &message.content {
            let Content::ToolCall(call) = content else {
                continue;
            };

            if !call.id.is_empty() {
                self.last_call_id = call.id.clone();
                let next = self.call_index.len();
                self.call_index.entry(call.id.clone()).or_insert(next);
            }

            // An argument fragment before any id has no position to merge at
            let Some(index) = self.call_index.get(&self.last_call_id) else {
                continue;
            };

            let mut item = json!({
                "index": index,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.arguments,
                },
            });

            if !call.id.is_empty() {
                item["id"] = json!(call.id);
            }

            calls.push(item);
        }

        if !calls.is_empty() {
            entry.as_object_mut().expect("entry is an object").remove("content");
            entry["tool_calls"] = json!(calls);
        }

        let chunk = self.chunk(&delta.id, &delta.model, json!([{"index": 0, "delta": entry}]));

        (self.sink)(chunk)
    }

    /// Emits the finish-reason chunk (and a usage chunk when requested) and
    /// returns the accumulated completion. Terminal framing such as `[DONE]`
    /// stays with the caller.
    pub fn finish(&mut self, include_usage: bool) -> Result<Completion> {
        let completion = self.acc.result();

        let reason = self.reason.or(completion.reason).unwrap_or_else(|| {
            let has_calls = completion
                .message
                .as_ref()
                .is_some_and(|m| !m.tool_calls().is_empty());

            if has_calls {
                CompletionReason::Tool
            } else {
                CompletionReason::Stop
            }
        });

        let chunk = self.chunk(
            &completion.id,
            &completion.model,
            json!([{"index": 0, "delta": {}, "finish_reason": to_finish_reason(reason)}]),
        );

        (self.sink)(chunk)?;

        if include_usage {
            if let Some(usage) = &completion.usage {
                let mut chunk = self.chunk(
                    &completion.id,
                    &completion.model,
                    json!([{"index": 0, "delta": {}}]),
                );

                chunk["usage"] = usage_body(usage);

                (self.sink)(chunk)?;
            }
        }

        Ok(completion)
    }

    fn chunk(&self, id: &str, model: &str, choices: Value) -> Value {
        let model = if model.is_empty() { &self.model } else { model };

        json!({
            "id": id,
            "object": "chat.completion.chunk",
            "created": Utc::now().timestamp(),
            "model": model,
            "choices": choices,
        })
    }
}

/// Builds the single-shot chat-protocol response body.
pub fn completion(completion: &Completion, fallback_model: &str) -> Value {
    let model = if completion.model.is_empty() {
        fallback_model
    } else {
        &completion.model
    };

    let mut result = json!({
        "id": completion.id,
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [],
    });

    if let Some(message) = &completion.message {
        let mut reason = to_finish_reason(completion.reason.unwrap_or(CompletionReason::Stop));

        let mut entry = json!({"role": "assistant"});

        let calls = tool_calls_body(message);

        if !calls.is_empty() {
            reason = "tool_calls";
            entry["tool_calls"] = json!(calls);
        } else {
            let text = message.text();

            if !text.is_empty() {
                entry["content"] = json!(text);
            }
        }

        result["choices"] = json!([{
            "index": 0,
            "message": entry,
            "finish_reason": reason,
        }]);
    }

    if let Some(usage) = &completion.usage {
        result["usage"] = usage_body(usage);
    }

    result
}

fn tool_calls_body(message: &Message) -> Vec<Value> {
    message
        .tool_calls()
        .iter()
        .map(|call| {
            json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.arguments,
                },
            })
        })
        .collect()
}

fn usage_body(usage: &Usage) -> Value {
    json!({
        "prompt_tokens": usage.input_tokens,
        "completion_tokens": usage.output_tokens,
        "total_tokens": usage.total(),
    })
}

fn to_finish_reason(reason: CompletionReason) -> &'static str {
    match reason {
        CompletionReason::Stop => "stop",
        CompletionReason::Length => "length",
        CompletionReason::Tool => "tool_calls",
        CompletionReason::Filter => "content_filter",
    }
}
