use serde::{Deserialize, Serialize};

use super::tool::ToolCall;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefusalContent {
    pub refusal: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultContent {
    pub call_id: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
/// One element of a message. Exactly one case is populated, and the order of
/// elements within a message is significant and preserved end-to-end.
pub enum Content {
    Text(TextContent),
    Refusal(RefusalContent),
    File(FileContent),
    ToolCall(ToolCall),
    ToolResult(ToolResultContent),
}

impl Content {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Content::Text(TextContent { text: text.into() })
    }

    pub fn refusal<S: Into<String>>(refusal: S) -> Self {
        Content::Refusal(RefusalContent {
            refusal: refusal.into(),
        })
    }

    pub fn file<N: Into<String>, M: Into<String>>(name: N, mime_type: M, data: Vec<u8>) -> Self {
        Content::File(FileContent {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        })
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Content::ToolCall(call)
    }

    pub fn tool_result<I: Into<String>, D: Into<String>>(call_id: I, data: D) -> Self {
        Content::ToolResult(ToolResultContent {
            call_id: call_id.into(),
            data: data.into(),
        })
    }

    /// Get the text if this is a Text variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(&text.text),
            _ => None,
        }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCall> {
        match self {
            Content::ToolCall(call) => Some(call),
            _ => None,
        }
    }
}
