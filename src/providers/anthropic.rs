use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::base::{Completer, CompletionOptions, StreamFn};
use super::configs::AnthropicProviderConfig;
use super::utils::{convert_file, ImageFormat, SseStream, IMAGE_MIME_TYPES};
use crate::models::completion::{Completion, CompletionAccumulator, CompletionReason, Usage};
use crate::models::content::Content;
use crate::models::message::{Message, Role};
use crate::models::tool::ToolCall;

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn build_payload(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        stream: bool,
    ) -> Result<Value> {
        let mut system = Vec::new();
        let mut converted = Vec::new();

        for message in messages {
            match message.role {
                Role::System => system.push(message.text()),
                Role::User => {
                    let mut blocks = Vec::new();

                    for content in &message.content {
                        match content {
                            Content::Text(text) => {
                                blocks.push(json!({"type": "text", "text": text.text}));
                            }
                            Content::File(file) => {
                                blocks.push(convert_file(
                                    file,
                                    ImageFormat::Anthropic,
                                    IMAGE_MIME_TYPES,
                                )?);
                            }
                            _ => {}
                        }
                    }

                    converted.push(json!({"role": "user", "content": blocks}));
                }
                Role::Assistant => {
                    let mut blocks = Vec::new();

                    for content in &message.content {
                        match content {
                            Content::Text(text) => {
                                blocks.push(json!({"type": "text", "text": text.text}));
                            }
                            Content::ToolCall(call) => {
                                let input: Value = serde_json::from_str(&call.arguments)
                                    .unwrap_or_else(|_| json!({}));

                                blocks.push(json!({
                                    "type": "tool_use",
                                    "id": call.id,
                                    "name": call.name,
                                    "input": input,
                                }));
                            }
                            _ => {}
                        }
                    }

                    converted.push(json!({"role": "assistant", "content": blocks}));
                }
                Role::Tool => {
                    // Tool results travel as user-role blocks on this protocol
                    for content in &message.content {
                        if let Content::ToolResult(tool_result) = content {
                            converted.push(json!({
                                "role": "user",
                                "content": [{
                                    "type": "tool_result",
                                    "tool_use_id": tool_result.call_id,
                                    "content": tool_result.data,
                                }],
                            }));
                        }
                    }
                }
            }
        }

        let mut payload = json!({
            "model": self.config.model,
            "messages": converted,
            "max_tokens": options.max_tokens.unwrap_or(8192),
        });

        let body = payload.as_object_mut().expect("payload is an object");

        if stream {
            body.insert("stream".to_string(), json!(true));
        }

        if !system.is_empty() {
            body.insert("system".to_string(), json!(system.join("\n\n")));
        }

        let mut tools: Vec<Value> = options
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters,
                })
            })
            .collect();

        // No native structured output; emulate with a forced tool whose
        // streamed input surfaces as text.
        if let Some(schema) = &options.schema {
            tools.push(json!({
                "name": schema.name,
                "description": schema.description.clone().unwrap_or_default(),
                "input_schema": schema.schema,
            }));

            body.insert(
                "tool_choice".to_string(),
                json!({"type": "tool", "name": schema.name}),
            );
        }

        if !tools.is_empty() {
            body.insert("tools".to_string(), json!(tools));
        }

        if !options.stop.is_empty() {
            body.insert("stop_sequences".to_string(), json!(options.stop));
        }

        if let Some(temperature) = options.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }

        Ok(payload)
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.config.host.trim_end_matches('/'));

        debug!(model = %self.config.model, "posting messages request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response),
            status if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() >= 500 => {
                Err(anyhow!("Server error: {}", status))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(anyhow!("Request failed: {} - {}", status, body))
            }
        }
    }

    fn get_usage(data: &Value) -> Option<Usage> {
        let usage = data.get("usage")?;

        Some(Usage::new(
            usage["input_tokens"].as_i64().unwrap_or_default() as i32,
            usage["output_tokens"].as_i64().unwrap_or_default() as i32,
        ))
    }

    async fn complete_once(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Completion> {
        let payload = self.build_payload(messages, options, false)?;
        let response: Value = self.post(&payload).await?.json().await?;

        if response["type"] == "error" {
            bail!("Anthropic API error: {}", response["error"]);
        }

        let mut message = Message::assistant();

        if let Some(blocks) = response["content"].as_array() {
            for block in blocks {
                match block["type"].as_str().unwrap_or_default() {
                    "text" => {
                        message = message.with_text(block["text"].as_str().unwrap_or_default());
                    }
                    "tool_use" => {
                        let input = &block["input"];

                        let arguments = if input.as_object().is_some_and(|o| !o.is_empty()) {
                            input.to_string()
                        } else {
                            "{}".to_string()
                        };

                        if options.schema.is_some() {
                            message = message.with_text(arguments);
                        } else {
                            message = message.with_tool_call(ToolCall::new(
                                block["id"].as_str().unwrap_or_default(),
                                block["name"].as_str().unwrap_or_default(),
                                arguments,
                            ));
                        }
                    }
                    _ => {}
                }
            }
        }

        let reason = response["stop_reason"]
            .as_str()
            .and_then(to_completion_reason)
            .unwrap_or(CompletionReason::Stop);

        Ok(Completion {
            id: response["id"].as_str().unwrap_or_default().to_string(),
            model: response["model"].as_str().unwrap_or_default().to_string(),
            reason: Some(reason),
            message: Some(message),
            usage: Self::get_usage(&response),
        })
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        handler: &mut StreamFn<'_>,
    ) -> Result<Completion> {
        let payload = self.build_payload(messages, options, true)?;
        let response = self.post(&payload).await?;

        let mut stream = SseStream::new(response);
        let mut acc = CompletionAccumulator::new();

        let schema_mode = options.schema.is_some();

        let mut message_id = String::new();
        let mut tool_block_open = false;
        let mut tool_args_seen = false;

        let mut emit = |acc: &mut CompletionAccumulator,
                        handler: &mut &mut StreamFn<'_>,
                        delta: Completion|
         -> Result<()> {
            acc.add(&delta);
            handler(delta)
        };

        let mut handler = handler;

        while let Some(event) = stream.next_event().await? {
            if event.data.is_empty() {
                continue;
            }

            let data: Value = serde_json::from_str(&event.data)?;

            match data["type"].as_str().unwrap_or_default() {
                "message_start" => {
                    message_id = data["message"]["id"].as_str().unwrap_or_default().to_string();

                    let delta = Completion {
                        id: message_id.clone(),
                        model: self.config.model.clone(),
                        message: Some(Message::assistant()),
                        usage: Self::get_usage(&data["message"]).map(|u| Usage::new(u.input_tokens, 0)),
                        ..Default::default()
                    };

                    emit(&mut acc, &mut handler, delta)?;
                }
                "content_block_start" => {
                    let block = &data["content_block"];

                    match block["type"].as_str().unwrap_or_default() {
                        "text" => {
                            let delta = Completion {
                                id: message_id.clone(),
                                model: self.config.model.clone(),
                                message: Some(
                                    Message::assistant()
                                        .with_text(block["text"].as_str().unwrap_or_default()),
                                ),
                                ..Default::default()
                            };

                            emit(&mut acc, &mut handler, delta)?;
                        }
                        "tool_use" => {
                            tool_block_open = true;
                            tool_args_seen = false;

                            let message = if schema_mode {
                                Message::assistant().with_text("")
                            } else {
                                Message::assistant().with_tool_call(ToolCall::new(
                                    block["id"].as_str().unwrap_or_default(),
                                    block["name"].as_str().unwrap_or_default(),
                                    "",
                                ))
                            };

                            let delta = Completion {
                                id: message_id.clone(),
                                model: self.config.model.clone(),
                                message: Some(message),
                                ..Default::default()
                            };

                            emit(&mut acc, &mut handler, delta)?;
                        }
                        _ => {}
                    }
                }
                "content_block_delta" => {
                    let block_delta = &data["delta"];

                    let message = match block_delta["type"].as_str().unwrap_or_default() {
                        "text_delta" => Some(
                            Message::assistant()
                                .with_text(block_delta["text"].as_str().unwrap_or_default()),
                        ),
                        "input_json_delta" => {
                            tool_args_seen = true;

                            let partial = block_delta["partial_json"].as_str().unwrap_or_default();

                            if schema_mode {
                                Some(Message::assistant().with_text(partial))
                            } else {
                                Some(
                                    Message::assistant()
                                        .with_tool_call(ToolCall::new("", "", partial)),
                                )
                            }
                        }
                        _ => None,
                    };

                    if let Some(message) = message {
                        let delta = Completion {
                            id: message_id.clone(),
                            model: self.config.model.clone(),
                            message: Some(message),
                            ..Default::default()
                        };

                        emit(&mut acc, &mut handler, delta)?;
                    }
                }
                "content_block_stop" => {
                    // Empty tool-use input still has to accumulate to valid JSON
                    if tool_block_open && !tool_args_seen && !schema_mode {
                        let delta = Completion {
                            id: message_id.clone(),
                            model: self.config.model.clone(),
                            message: Some(
                                Message::assistant().with_tool_call(ToolCall::new("", "", "{}")),
                            ),
                            ..Default::default()
                        };

                        emit(&mut acc, &mut handler, delta)?;
                    }

                    tool_block_open = false;
                }
                "message_delta" => {
                    let delta = Completion {
                        id: message_id.clone(),
                        model: self.config.model.clone(),
                        reason: data["delta"]["stop_reason"]
                            .as_str()
                            .and_then(to_completion_reason),
                        message: Some(Message::assistant()),
                        usage: data["usage"]["output_tokens"]
                            .as_i64()
                            .map(|v| Usage::new(0, v as i32)),
                        ..Default::default()
                    };

                    emit(&mut acc, &mut handler, delta)?;
                }
                "message_stop" => break,
                "error" => bail!("Anthropic API error: {}", data["error"]),
                _ => {} // ping and future event types
            }
        }

        let mut completion = acc.result();

        if completion.reason.is_none() {
            completion.reason = Some(CompletionReason::Stop);
        }

        Ok(completion)
    }
}

#[async_trait]
impl Completer for AnthropicProvider {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        handler: Option<&mut StreamFn<'_>>,
    ) -> Result<Completion> {
        match handler {
            Some(handler) => self.complete_stream(messages, options, handler).await,
            None => self.complete_once(messages, options).await,
        }
    }
}

fn to_completion_reason(val: &str) -> Option<CompletionReason> {
    match val {
        "end_turn" | "stop_sequence" => Some(CompletionReason::Stop),
        "max_tokens" => Some(CompletionReason::Length),
        "tool_use" => Some(CompletionReason::Tool),
        "refusal" => Some(CompletionReason::Filter),
        _ => None,
    }
}
