use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::base::{Completer, CompletionFormat, CompletionOptions, StreamFn};
use super::configs::OllamaProviderConfig;
use super::utils::{LineStream, IMAGE_MIME_TYPES};
use crate::models::completion::{Completion, CompletionAccumulator, CompletionReason, Usage};
use crate::models::content::Content;
use crate::models::message::{Message, Role};
use crate::models::tool::ToolCall;

pub struct OllamaProvider {
    client: Client,
    config: OllamaProviderConfig,
}

impl OllamaProvider {
    pub fn new(config: OllamaProviderConfig) -> Result<Self> {
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
        let mut converted = Vec::new();

        for message in messages {
            match message.role {
                Role::System => {
                    converted.push(json!({"role": "system", "content": message.text()}));
                }
                Role::User => {
                    let mut entry = json!({"role": "user", "content": message.text()});
                    let mut images = Vec::new();

                    for content in &message.content {
                        if let Content::File(file) = content {
                            if !IMAGE_MIME_TYPES.contains(&file.mime_type.as_str()) {
                                return Err(anyhow!(
                                    "unsupported content type: {}",
                                    file.mime_type
                                ));
                            }

                            images.push(BASE64.encode(&file.data));
                        }
                    }

                    if !images.is_empty() {
                        entry["images"] = json!(images);
                    }

                    converted.push(entry);
                }
                Role::Assistant => {
                    let mut entry = json!({"role": "assistant", "content": message.text()});

                    let calls: Vec<Value> = message
                        .tool_calls()
                        .iter()
                        .map(|call| {
                            let arguments: Value = serde_json::from_str(&call.arguments)
                                .unwrap_or_else(|_| json!({}));

                            json!({
                                "function": {
                                    "name": call.name,
                                    "arguments": arguments,
                                }
                            })
                        })
                        .collect();

                    if !calls.is_empty() {
                        entry["tool_calls"] = json!(calls);
                    }

                    converted.push(entry);
                }
                Role::Tool => {
                    for content in &message.content {
                        if let Content::ToolResult(tool_result) = content {
                            converted.push(json!({
                                "role": "tool",
                                "content": tool_result.data,
                            }));
                        }
                    }
                }
            }
        }

        let mut payload = json!({
            "model": self.config.model,
            "messages": converted,
            "stream": stream,
        });

        let body = payload.as_object_mut().expect("payload is an object");

        if !options.tools.is_empty() {
            let tools: Vec<Value> = options
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect();

            body.insert("tools".to_string(), json!(tools));
        }

        if let Some(schema) = &options.schema {
            body.insert("format".to_string(), schema.schema.clone());
        } else if let Some(CompletionFormat::Json) = options.format {
            body.insert("format".to_string(), json!("json"));
        }

        let mut ollama_options = serde_json::Map::new();

        if let Some(max_tokens) = options.max_tokens {
            ollama_options.insert("num_predict".to_string(), json!(max_tokens));
        }

        if let Some(temperature) = options.temperature {
            ollama_options.insert("temperature".to_string(), json!(temperature));
        }

        if !options.stop.is_empty() {
            ollama_options.insert("stop".to_string(), json!(options.stop));
        }

        if !ollama_options.is_empty() {
            body.insert("options".to_string(), Value::Object(ollama_options));
        }

        Ok(payload)
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.config.host.trim_end_matches('/'));

        debug!(model = %self.config.model, "posting chat request");

        let response = self.client.post(&url).json(payload).send().await?;

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

    // Chunks are coarse: tool calls arrive whole and carry no ids, so we
    // mint one per call before handing them downstream. The completion id
    // is minted once per request and shared by every chunk.
    fn parse_chunk(&self, id: &str, data: &Value) -> Completion {
        let mut message = Message::assistant();

        let text = data["message"]["content"].as_str().unwrap_or_default();

        if !text.is_empty() {
            message = message.with_text(text);
        }

        if let Some(calls) = data["message"]["tool_calls"].as_array() {
            for call in calls {
                let arguments = match &call["function"]["arguments"] {
                    Value::Object(map) if !map.is_empty() => {
                        Value::Object(map.clone()).to_string()
                    }
                    _ => "{}".to_string(),
                };

                message = message.with_tool_call(ToolCall::new(
                    Uuid::new_v4().to_string(),
                    call["function"]["name"].as_str().unwrap_or_default(),
                    arguments,
                ));
            }
        }

        let reason = if data["done"].as_bool().unwrap_or_default() {
            if !message.tool_calls().is_empty() {
                Some(CompletionReason::Tool)
            } else {
                data["done_reason"]
                    .as_str()
                    .and_then(to_completion_reason)
                    .or(Some(CompletionReason::Stop))
            }
        } else if !message.tool_calls().is_empty() {
            Some(CompletionReason::Tool)
        } else {
            None
        };

        let usage = match (
            data["prompt_eval_count"].as_i64(),
            data["eval_count"].as_i64(),
        ) {
            (None, None) => None,
            (input, output) => Some(Usage::new(
                input.unwrap_or_default() as i32,
                output.unwrap_or_default() as i32,
            )),
        };

        Completion {
            id: id.to_string(),
            model: data["model"]
                .as_str()
                .unwrap_or(&self.config.model)
                .to_string(),
            reason,
            message: Some(message),
            usage,
        }
    }

    async fn complete_once(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<Completion> {
        let payload = self.build_payload(messages, options, false)?;
        let data: Value = self.post(&payload).await?.json().await?;

        Ok(self.parse_chunk(&Uuid::new_v4().to_string(), &data))
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        handler: &mut StreamFn<'_>,
    ) -> Result<Completion> {
        let payload = self.build_payload(messages, options, true)?;
        let response = self.post(&payload).await?;

        let mut stream = LineStream::new(response);
        let mut acc = CompletionAccumulator::new();

        let id = Uuid::new_v4().to_string();

        while let Some(line) = stream.next_line().await? {
            let data: Value = serde_json::from_str(&line)?;

            if let Some(error) = data["error"].as_str() {
                return Err(anyhow!("Ollama API error: {}", error));
            }

            let done = data["done"].as_bool().unwrap_or_default();

            let delta = self.parse_chunk(&id, &data);

            acc.add(&delta);
            handler(delta)?;

            if done {
                break;
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
impl Completer for OllamaProvider {
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
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup_mock_server(template: ResponseTemplate) -> (MockServer, OllamaProvider) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(template)
            .mount(&mock_server)
            .await;

        let config = OllamaProviderConfig {
            host: mock_server.uri(),
            model: "llama3.2".to_string(),
        };

        let provider = OllamaProvider::new(config).unwrap();
        (mock_server, provider)
    }

    #[tokio::test]
    async fn test_complete_basic() -> Result<()> {
        let response_body = json!({
            "model": "llama3.2",
            "created_at": "2024-09-12T21:17:29.110811Z",
            "message": {
                "role": "assistant",
                "content": "Hello! How can I help you today?"
            },
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 12,
            "eval_count": 19
        });

        let (_, provider) =
            setup_mock_server(ResponseTemplate::new(200).set_body_json(response_body)).await;

        let messages = vec![Message::user().with_text("Hello?")];
        let completion = provider
            .complete(&messages, &CompletionOptions::default(), None)
            .await?;

        assert_eq!(completion.reason, Some(CompletionReason::Stop));
        assert_eq!(
            completion.message.unwrap().text(),
            "Hello! How can I help you today?"
        );
        assert_eq!(completion.usage, Some(Usage::new(12, 19)));

        Ok(())
    }

    #[tokio::test]
    async fn test_complete_tool_calls_get_ids() -> Result<()> {
        let response_body = json!({
            "model": "llama3.2",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [
                    {"function": {"name": "get_weather", "arguments": {"location": "NY"}}},
                    {"function": {"name": "get_time", "arguments": {}}}
                ]
            },
            "done": true,
            "done_reason": "stop"
        });

        let (_, provider) =
            setup_mock_server(ResponseTemplate::new(200).set_body_json(response_body)).await;

        let messages = vec![Message::user().with_text("weather and time in NY?")];
        let completion = provider
            .complete(&messages, &CompletionOptions::default(), None)
            .await?;

        assert_eq!(completion.reason, Some(CompletionReason::Tool));

        let message = completion.message.unwrap();
        let calls = message.tool_calls();

        assert_eq!(calls.len(), 2);
        assert!(!calls[0].id.is_empty());
        assert!(!calls[1].id.is_empty());
        assert_ne!(calls[0].id, calls[1].id);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(
            serde_json::from_str::<Value>(&calls[0].arguments)?,
            json!({"location": "NY"})
        );
        assert_eq!(calls[1].arguments, "{}");

        Ok(())
    }

    #[tokio::test]
    async fn test_complete_stream() -> Result<()> {
        let body = [
            json!({"model": "llama3.2", "message": {"role": "assistant", "content": "Hel"}, "done": false}),
            json!({"model": "llama3.2", "message": {"role": "assistant", "content": "lo!"}, "done": false}),
            json!({"model": "llama3.2", "message": {"role": "assistant", "content": ""}, "done": true, "done_reason": "stop", "prompt_eval_count": 4, "eval_count": 2}),
        ]
        .map(|v| v.to_string())
        .join("\n");

        let (_, provider) = setup_mock_server(
            ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"),
        )
        .await;

        let mut fragments = Vec::new();
        let mut handler = |delta: Completion| {
            if let Some(message) = &delta.message {
                let text = message.text();
                if !text.is_empty() {
                    fragments.push(text);
                }
            }
            Ok(())
        };

        let messages = vec![Message::user().with_text("Hello?")];
        let completion = provider
            .complete(&messages, &CompletionOptions::default(), Some(&mut handler))
            .await?;

        assert_eq!(fragments, vec!["Hel", "lo!"]);
        assert_eq!(completion.reason, Some(CompletionReason::Stop));
        assert_eq!(completion.message.unwrap().text(), "Hello!");
        assert_eq!(completion.usage, Some(Usage::new(4, 2)));

        Ok(())
    }

    #[tokio::test]
    async fn test_stream_deltas_share_one_completion_id() -> Result<()> {
        let body = [
            json!({"model": "llama3.2", "message": {"role": "assistant", "content": "a"}, "done": false}),
            json!({"model": "llama3.2", "message": {"role": "assistant", "content": "b"}, "done": false}),
            json!({"model": "llama3.2", "message": {"role": "assistant", "content": ""}, "done": true, "done_reason": "stop"}),
        ]
        .map(|v| v.to_string())
        .join("\n");

        let (_, provider) = setup_mock_server(
            ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"),
        )
        .await;

        let mut ids = Vec::new();
        let mut handler = |delta: Completion| {
            ids.push(delta.id);
            Ok(())
        };

        let messages = vec![Message::user().with_text("Hello?")];
        let completion = provider
            .complete(&messages, &CompletionOptions::default(), Some(&mut handler))
            .await?;

        assert_eq!(ids.len(), 3);
        assert!(!ids[0].is_empty());
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(completion.id, ids[0]);

        Ok(())
    }

    #[test]
    fn test_schema_becomes_format() -> Result<()> {
        let config = OllamaProviderConfig {
            host: "http://localhost:11434".into(),
            model: "llama3.2".into(),
        };
        let provider = OllamaProvider::new(config)?;

        let options = CompletionOptions {
            schema: Some(crate::models::tool::Schema {
                name: "result".into(),
                description: None,
                schema: json!({"type": "object", "properties": {}}),
                strict: None,
            }),
            ..Default::default()
        };

        let payload = provider.build_payload(&[Message::user().with_text("hi")], &options, false)?;
        assert_eq!(payload["format"], json!({"type": "object", "properties": {}}));

        let payload = provider.build_payload(
            &[Message::user().with_text("hi")],
            &CompletionOptions {
                format: Some(CompletionFormat::Json),
                ..Default::default()
            },
            false,
        )?;
        assert_eq!(payload["format"], "json");

        Ok(())
    }
}
