use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use crate::errors::ToolOutcome;
use crate::models::completion::Completion;
use crate::models::content::Content;
use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::providers::base::{Completer, CompletionOptions, StreamFn};

/// A collaborator offering named, schema-described capabilities the model
/// may invoke mid-conversation.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn tools(&self) -> Vec<Tool>;

    async fn execute(&self, name: &str, arguments: Value) -> ToolOutcome<Value>;
}

/// Runs the tool-orchestration loop around an inner completer.
///
/// Implements `Completer` itself, so it composes with routing and the
/// outbound emitters. Each turn the model's tool calls matching a registered
/// provider are executed one at a time, in received order, and their results
/// appended to the conversation before the next turn; deltas for registered
/// tools never reach the caller's stream handler.
pub struct Agent {
    completer: Box<dyn Completer>,
    tools: Vec<Box<dyn ToolProvider>>,
    max_turns: Option<usize>,
}

impl Agent {
    pub fn new(completer: Box<dyn Completer>) -> Self {
        Self {
            completer,
            tools: Vec::new(),
            max_turns: None,
        }
    }

    pub fn with_tools(mut self, provider: Box<dyn ToolProvider>) -> Self {
        self.tools.push(provider);
        self
    }

    /// Caps the number of model turns. Unset means unbounded, so a
    /// misbehaving backend can loop until the caller cancels.
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = Some(max_turns);
        self
    }
}

#[async_trait]
impl Completer for Agent {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        handler: Option<&mut StreamFn<'_>>,
    ) -> Result<Completion> {
        // Registered tool name -> owning provider
        let mut agent_tools: HashMap<String, usize> = HashMap::new();
        let mut input_tools: HashMap<String, Tool> = HashMap::new();

        for (index, provider) in self.tools.iter().enumerate() {
            for tool in provider.tools() {
                agent_tools.insert(tool.name.clone(), index);
                input_tools.insert(tool.name.clone(), tool);
            }
        }

        // Caller-supplied tools win on name clashes
        for tool in &options.tools {
            input_tools.insert(tool.name.clone(), tool.clone());
        }

        let mut input_options = options.clone();
        input_options.tools = input_tools.into_values().collect();

        let mut input = messages.to_vec();

        // Continuation deltas may elide the call id or name; resolve them
        // from the most recently seen values and a per-id name map.
        let stream_id = Uuid::new_v4().to_string();
        let mut last_id = String::new();
        let mut last_name = String::new();
        let mut names_by_id: HashMap<String, String> = HashMap::new();

        let mut handler = handler;

        let mut turns = 0usize;

        loop {
            if let Some(max_turns) = self.max_turns {
                if turns >= max_turns {
                    bail!("tool loop exceeded {} turns", max_turns);
                }
            }

            turns += 1;

            let completion = match handler.as_deref_mut() {
                Some(caller) => {
                    let mut wrapped = |mut delta: Completion| -> Result<()> {
                        delta.id = stream_id.clone();

                        let Some(message) = delta.message.take() else {
                            if delta.reason.is_some() || delta.usage.is_some() {
                                return caller(delta);
                            }
                            return Ok(());
                        };

                        let mut forwarded = Message {
                            role: message.role,
                            content: Vec::new(),
                        };

                        for content in message.content {
                            let Content::ToolCall(call) = &content else {
                                forwarded.content.push(content);
                                continue;
                            };

                            if !call.id.is_empty() {
                                last_id = call.id.clone();
                            }

                            if !call.name.is_empty() {
                                last_name = call.name.clone();
                                names_by_id.insert(last_id.clone(), last_name.clone());
                            }

                            let name = names_by_id
                                .get(&last_id)
                                .map(String::as_str)
                                .unwrap_or(&last_name);

                            if agent_tools.contains_key(name) {
                                continue;
                            }

                            forwarded.content.push(content);
                        }

                        if forwarded.content.is_empty()
                            && delta.reason.is_none()
                            && delta.usage.is_none()
                        {
                            return Ok(());
                        }

                        delta.message = Some(forwarded);
                        caller(delta)
                    };

                    self.completer
                        .complete(&input, &input_options, Some(&mut wrapped))
                        .await?
                }
                None => self.completer.complete(&input, &input_options, None).await?,
            };

            let mut completion = completion;
            completion.id = stream_id.clone();

            let Some(message) = completion.message.clone() else {
                return Ok(completion);
            };

            input.push(message.clone());

            let mut looped = false;

            for call in message.tool_calls() {
                let Some(&index) = agent_tools.get(call.name.as_str()) else {
                    continue;
                };

                let arguments: Value = serde_json::from_str(&call.arguments)?;

                debug!(tool = %call.name, "executing tool call");

                let result = self.tools[index].execute(&call.name, arguments).await?;
                let data = serde_json::to_string(&result)?;

                input.push(Message::tool().with_tool_result(&call.id, data));

                looped = true;
            }

            if !looped {
                return Ok(completion);
            }
        }
    }
}
