use serde::{Deserialize, Serialize};

use super::content::Content;
use super::message::{Message, Role};
use super::tool::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionReason {
    Stop,
    Length,
    Tool,
    Filter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: i32,
    pub output_tokens: i32,
}

impl Usage {
    pub fn new(input_tokens: i32, output_tokens: i32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> i32 {
        self.input_tokens + self.output_tokens
    }
}

/// One model response, or one incremental delta of it.
///
/// On a partial, absent fields mean "no new information", never "clear the
/// previous value".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub id: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<CompletionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Folds a sequence of partial completions into one final completion.
///
/// `add` is called once per delta, in order, by a single owner. `result` is
/// idempotent and callable at any time.
#[derive(Debug, Default)]
pub struct CompletionAccumulator {
    id: String,
    model: String,
    reason: Option<CompletionReason>,
    role: Option<Role>,

    text: String,
    refusal: String,

    tool_calls: Vec<ToolCall>,

    usage: Option<Usage>,
}

impl CompletionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, completion: &Completion) {
        if !completion.id.is_empty() {
            self.id = completion.id.clone();
        }

        if !completion.model.is_empty() {
            self.model = completion.model.clone();
        }

        if let Some(reason) = completion.reason {
            self.reason = Some(reason);
        }

        if let Some(message) = &completion.message {
            self.role = Some(message.role);

            for content in &message.content {
                match content {
                    Content::Text(text) => self.text.push_str(&text.text),
                    Content::Refusal(refusal) => self.refusal.push_str(&refusal.refusal),
                    Content::ToolCall(call) => {
                        // A non-empty id starts a new entry; an empty id is a
                        // continuation of the most recently started one.
                        if !call.id.is_empty() {
                            self.tool_calls.push(ToolCall {
                                id: call.id.clone(),
                                ..Default::default()
                            });
                        }

                        let Some(last) = self.tool_calls.last_mut() else {
                            continue;
                        };

                        last.name.push_str(&call.name);
                        last.arguments.push_str(&call.arguments);
                    }
                    _ => {}
                }
            }
        }

        if let Some(usage) = completion.usage {
            let sum = self.usage.get_or_insert_with(Usage::default);
            sum.input_tokens += usage.input_tokens;
            sum.output_tokens += usage.output_tokens;
        }
    }

    pub fn result(&self) -> Completion {
        let mut content = Vec::new();

        if !self.text.is_empty() {
            content.push(Content::text(self.text.clone()));
        }

        if !self.refusal.is_empty() {
            content.push(Content::refusal(self.refusal.clone()));
        }

        for call in &self.tool_calls {
            content.push(Content::tool_call(call.clone()));
        }

        Completion {
            id: self.id.clone(),
            model: self.model.clone(),
            reason: self.reason,
            message: Some(Message {
                role: self.role.unwrap_or(Role::Assistant),
                content,
            }),
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_delta(text: &str) -> Completion {
        Completion {
            message: Some(Message::assistant().with_text(text)),
            ..Default::default()
        }
    }

    fn call_delta(id: &str, name: &str, arguments: &str) -> Completion {
        Completion {
            message: Some(Message::assistant().with_tool_call(ToolCall::new(id, name, arguments))),
            ..Default::default()
        }
    }

    #[test]
    fn test_text_concatenation_is_chunking_independent() {
        let full = "The quick brown fox jumps over the lazy dog";

        for size in [1, 3, 7, full.len()] {
            let mut acc = CompletionAccumulator::new();

            let chars: Vec<char> = full.chars().collect();
            for chunk in chars.chunks(size) {
                acc.add(&text_delta(&chunk.iter().collect::<String>()));
            }

            let result = acc.result();
            assert_eq!(result.message.unwrap().text(), full);
        }
    }

    #[test]
    fn test_tool_call_fragments() {
        let mut acc = CompletionAccumulator::new();

        acc.add(&call_delta("c1", "get_weather", ""));
        acc.add(&call_delta("", "", "{\"loc"));
        acc.add(&call_delta("", "", "\":\"NY\"}"));

        let result = acc.result();
        let message = result.message.unwrap();
        let calls = message.tool_calls();

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].arguments, "{\"loc\":\"NY\"}");

        let parsed: serde_json::Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(parsed["loc"], "NY");
    }

    #[test]
    fn test_multiple_tool_calls_keep_order() {
        let mut acc = CompletionAccumulator::new();

        acc.add(&call_delta("c1", "first", "{}"));
        acc.add(&call_delta("c2", "second", ""));
        acc.add(&call_delta("", "", "{\"a\":1}"));

        let result = acc.result();
        let message = result.message.unwrap();
        let calls = message.tool_calls();

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[1].name, "second");
        assert_eq!(calls[1].arguments, "{\"a\":1}");
    }

    #[test]
    fn test_last_non_empty_wins() {
        let mut acc = CompletionAccumulator::new();

        acc.add(&Completion {
            id: "a".into(),
            model: "m1".into(),
            ..Default::default()
        });
        acc.add(&Completion::default());
        acc.add(&Completion {
            id: "b".into(),
            reason: Some(CompletionReason::Stop),
            ..Default::default()
        });

        let result = acc.result();
        assert_eq!(result.id, "b");
        assert_eq!(result.model, "m1");
        assert_eq!(result.reason, Some(CompletionReason::Stop));
    }

    #[test]
    fn test_usage_sums_field_by_field() {
        let mut acc = CompletionAccumulator::new();

        acc.add(&Completion {
            usage: Some(Usage::new(10, 0)),
            ..Default::default()
        });
        acc.add(&Completion {
            usage: Some(Usage::new(0, 25)),
            ..Default::default()
        });

        let result = acc.result();
        assert_eq!(result.usage, Some(Usage::new(10, 25)));
        assert_eq!(result.usage.unwrap().total(), 35);
    }

    #[test]
    fn test_result_is_idempotent() {
        let mut acc = CompletionAccumulator::new();
        acc.add(&text_delta("hello"));

        let first = acc.result();
        let second = acc.result();
        assert_eq!(first, second);

        acc.add(&text_delta(" world"));
        assert_eq!(acc.result().message.unwrap().text(), "hello world");
    }

    #[test]
    fn test_text_and_refusal_emit_one_element_each() {
        let mut acc = CompletionAccumulator::new();

        acc.add(&text_delta("a"));
        acc.add(&Completion {
            message: Some(Message::assistant().with_refusal("no")),
            ..Default::default()
        });
        acc.add(&text_delta("b"));

        let result = acc.result();
        let message = result.message.unwrap();

        assert_eq!(message.content.len(), 2);
        assert_eq!(message.text(), "ab");
    }
}
