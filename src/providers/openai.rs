use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::base::{Completer, CompletionFormat, CompletionOptions, Effort, StreamFn, Verbosity};
use super::configs::OpenAiProviderConfig;
use super::utils::{messages_to_openai_spec, tools_to_openai_spec, SseStream};
use crate::models::completion::{Completion, CompletionAccumulator, CompletionReason, Usage};
use crate::models::message::Message;
use crate::models::tool::ToolCall;

// Models that take max_completion_tokens instead of max_tokens
const REASONING_MODELS: &[&str] = &["o1", "o1-mini", "o3-mini"];

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn get_usage(data: &Value) -> Option<Usage> {
        let usage = data.get("usage")?;

        let input_tokens = usage.get("prompt_tokens").and_then(|v| v.as_i64())? as i32;

        let output_tokens = usage
            .get("completion_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or_default() as i32;

        Some(Usage::new(input_tokens, output_tokens))
    }

    fn build_payload(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        stream: bool,
    ) -> Result<Value> {
        let messages_spec = messages_to_openai_spec(messages)?;
        let tools_spec = tools_to_openai_spec(&options.tools)?;

        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_spec,
        });

        let body = payload.as_object_mut().expect("payload is an object");

        if stream {
            body.insert("stream".to_string(), json!(true));
            body.insert(
                "stream_options".to_string(),
                json!({"include_usage": true}),
            );
        }

        if !tools_spec.is_empty() {
            body.insert("tools".to_string(), json!(tools_spec));
        }

        if let Some(effort) = options.effort {
            let value = match effort {
                Effort::Minimal => "minimal",
                Effort::Low => "low",
                Effort::Medium => "medium",
                Effort::High => "high",
            };

            body.insert("reasoning_effort".to_string(), json!(value));
        }

        if let Some(verbosity) = options.verbosity {
            let value = match verbosity {
                Verbosity::Low => "low",
                Verbosity::Medium => "medium",
                Verbosity::High => "high",
            };

            body.insert("verbosity".to_string(), json!(value));
        }

        if let Some(schema) = &options.schema {
            let mut json_schema = json!({
                "name": schema.name,
                "schema": schema.schema,
            });

            if let Some(description) = &schema.description {
                json_schema["description"] = json!(description);
            }

            if let Some(strict) = schema.strict {
                json_schema["strict"] = json!(strict);
            }

            body.insert(
                "response_format".to_string(),
                json!({"type": "json_schema", "json_schema": json_schema}),
            );
        } else if options.format == Some(CompletionFormat::Json) {
            body.insert(
                "response_format".to_string(),
                json!({"type": "json_object"}),
            );
        }

        if !options.stop.is_empty() {
            body.insert("stop".to_string(), json!(options.stop));
        }

        if let Some(max_tokens) = options.max_tokens {
            if REASONING_MODELS.contains(&self.config.model.as_str()) {
                body.insert("max_completion_tokens".to_string(), json!(max_tokens));
            } else {
                body.insert("max_tokens".to_string(), json!(max_tokens));
            }
        }

        if let Some(temperature) = options.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }

        Ok(payload)
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );

        debug!(model = %self.config.model, "posting chat completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
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

    async fn complete_once(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Completion> {
        let payload = self.build_payload(messages, options, false)?;
        let response: Value = self.post(&payload).await?.json().await?;

        if let Some(error) = response.get("error") {
            bail!("OpenAI API error: {}", error);
        }

        let choice = &response["choices"][0];
        let original = &choice["message"];

        let mut message = Message::assistant();

        if let Some(text) = original.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                message = message.with_text(text);
            }
        }

        if let Some(refusal) = original.get("refusal").and_then(|v| v.as_str()) {
            if !refusal.is_empty() {
                message = message.with_refusal(refusal);
            }
        }

        if let Some(calls) = original.get("tool_calls").and_then(|v| v.as_array()) {
            for call in calls {
                let arguments = call["function"]["arguments"].as_str().unwrap_or_default();

                message = message.with_tool_call(ToolCall::new(
                    call["id"].as_str().unwrap_or_default(),
                    call["function"]["name"].as_str().unwrap_or_default(),
                    if arguments.is_empty() { "{}" } else { arguments },
                ));
            }
        }

        let reason = choice["finish_reason"]
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

        // A call announced without an argument payload must still end up as
        // valid JSON once accumulated.
        let mut pending_empty_call = false;

        while let Some(event) = stream.next_event().await? {
            if event.data == "[DONE]" {
                break;
            }

            let chunk: Value = serde_json::from_str(&event.data)?;

            if let Some(error) = chunk.get("error") {
                bail!("OpenAI API error: {}", error);
            }

            let mut delta = Completion {
                id: chunk["id"].as_str().unwrap_or_default().to_string(),
                model: chunk["model"].as_str().unwrap_or_default().to_string(),
                ..Default::default()
            };

            let mut message = Message::assistant();

            if let Some(choice) = chunk["choices"].get(0) {
                delta.reason = choice["finish_reason"]
                    .as_str()
                    .and_then(to_completion_reason);

                let content = &choice["delta"];

                if let Some(text) = content.get("content").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        message = message.with_text(text);
                    }
                }

                if let Some(refusal) = content.get("refusal").and_then(|v| v.as_str()) {
                    if !refusal.is_empty() {
                        message = message.with_refusal(refusal);
                    }
                }

                if let Some(calls) = content.get("tool_calls").and_then(|v| v.as_array()) {
                    for call in calls {
                        let id = call["id"].as_str().unwrap_or_default();
                        let name = call["function"]["name"].as_str().unwrap_or_default();
                        let arguments = call["function"]["arguments"].as_str().unwrap_or_default();

                        if !id.is_empty() {
                            if pending_empty_call {
                                message = message.with_tool_call(ToolCall::new("", "", "{}"));
                            }

                            pending_empty_call = true;
                        }

                        if !arguments.is_empty() {
                            pending_empty_call = false;
                        }

                        message = message.with_tool_call(ToolCall::new(id, name, arguments));
                    }
                }
            }

            delta.message = Some(message);
            delta.usage = Self::get_usage(&chunk);

            acc.add(&delta);
            handler(delta)?;
        }

        if pending_empty_call {
            let delta = Completion {
                message: Some(Message::assistant().with_tool_call(ToolCall::new("", "", "{}"))),
                ..Default::default()
            };

            acc.add(&delta);
            handler(delta)?;
        }

        let mut completion = acc.result();

        if completion.reason.is_none() {
            let has_calls = completion
                .message
                .as_ref()
                .is_some_and(|m| !m.tool_calls().is_empty());

            completion.reason = Some(if has_calls {
                CompletionReason::Tool
            } else {
                CompletionReason::Stop
            });
        }

        Ok(completion)
    }
}

#[async_trait]
impl Completer for OpenAiProvider {
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
        "stop" => Some(CompletionReason::Stop),
        "length" => Some(CompletionReason::Length),
        "tool_calls" => Some(CompletionReason::Tool),
        "content_filter" => Some(CompletionReason::Filter),
        _ => None,
    }
}
