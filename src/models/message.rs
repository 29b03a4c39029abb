use serde::{Deserialize, Serialize};

use super::content::Content;
use super::tool::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A message to or from a model
pub struct Message {
    pub role: Role,
    pub content: Vec<Content>,
}

impl Message {
    pub fn new(role: Role) -> Self {
        Message {
            role,
            content: Vec::new(),
        }
    }

    /// Create a new system message
    pub fn system() -> Self {
        Message::new(Role::System)
    }

    /// Create a new user message
    pub fn user() -> Self {
        Message::new(Role::User)
    }

    /// Create a new assistant message
    pub fn assistant() -> Self {
        Message::new(Role::Assistant)
    }

    /// Create a new tool message
    pub fn tool() -> Self {
        Message::new(Role::Tool)
    }

    /// Add any Content to the message
    pub fn with_content(mut self, content: Content) -> Self {
        self.content.push(content);
        self
    }

    /// Add text content to the message
    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_content(Content::text(text))
    }

    /// Add refusal content to the message
    pub fn with_refusal<S: Into<String>>(self, refusal: S) -> Self {
        self.with_content(Content::refusal(refusal))
    }

    /// Add an attached file to the message
    pub fn with_file<N: Into<String>, M: Into<String>>(
        self,
        name: N,
        mime_type: M,
        data: Vec<u8>,
    ) -> Self {
        self.with_content(Content::file(name, mime_type, data))
    }

    /// Add a tool call to the message
    pub fn with_tool_call(self, call: ToolCall) -> Self {
        self.with_content(Content::tool_call(call))
    }

    /// Add a tool result to the message
    pub fn with_tool_result<I: Into<String>, D: Into<String>>(self, call_id: I, data: D) -> Self {
        self.with_content(Content::tool_result(call_id, data))
    }

    /// All text fragments joined with a blank line
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|content| content.as_text())
            .collect();

        parts.join("\n\n")
    }

    /// All tool calls carried by this message, in order
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content
            .iter()
            .filter_map(|content| content.as_tool_call())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let message = Message::user()
            .with_text("look at this")
            .with_file("report.png", "image/png", vec![1, 2, 3]);

        assert_eq!(message.role, Role::User);
        assert_eq!(message.content.len(), 2);
        assert_eq!(message.text(), "look at this");
    }

    #[test]
    fn test_text_joins_fragments() {
        let message = Message::assistant().with_text("one").with_text("two");
        assert_eq!(message.text(), "one\n\ntwo");
    }

    #[test]
    fn test_tool_calls() {
        let message = Message::assistant()
            .with_text("calling")
            .with_tool_call(ToolCall::new("c1", "get_weather", "{}"));

        let calls = message.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
    }
}
