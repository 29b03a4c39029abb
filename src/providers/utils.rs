use anyhow::{anyhow, bail, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::pin::Pin;

use crate::models::content::{Content, FileContent};
use crate::models::message::{Message, Role};
use crate::models::tool::Tool;

#[derive(Debug, Copy, Clone)]
pub enum ImageFormat {
    OpenAi,
    Anthropic,
}

/// Mime types the image-capable backends accept as inline attachments.
pub const IMAGE_MIME_TYPES: &[&str] = &["image/png", "image/jpeg", "image/webp", "image/gif"];

/// Base64-inline a file against an allow-list, rejecting anything else with
/// an explicit error rather than silently dropping it.
pub fn convert_file(file: &FileContent, format: ImageFormat, allowed: &[&str]) -> Result<Value> {
    if !allowed.contains(&file.mime_type.as_str()) {
        bail!("unsupported content type: {}", file.mime_type);
    }

    let data = BASE64.encode(&file.data);

    Ok(match format {
        ImageFormat::OpenAi => json!({
            "type": "image_url",
            "image_url": {
                "url": format!("data:{};base64,{}", file.mime_type, data)
            }
        }),
        ImageFormat::Anthropic => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": file.mime_type,
                "data": data,
            }
        }),
    })
}

/// Convert canonical messages to the openai chat message specification.
/// System messages stay in-list; files become inline image parts.
pub fn messages_to_openai_spec(messages: &[Message]) -> Result<Vec<Value>> {
    let mut result = Vec::new();

    for message in messages {
        match message.role {
            Role::System => {
                result.push(json!({
                    "role": "system",
                    "content": message.text(),
                }));
            }
            Role::User => {
                let mut parts = Vec::new();

                for content in &message.content {
                    match content {
                        Content::Text(text) => {
                            parts.push(json!({"type": "text", "text": text.text}));
                        }
                        Content::File(file) => {
                            parts.push(convert_file(file, ImageFormat::OpenAi, IMAGE_MIME_TYPES)?);
                        }
                        _ => {}
                    }
                }

                result.push(json!({
                    "role": "user",
                    "content": parts,
                }));
            }
            Role::Assistant => {
                let mut converted = json!({
                    "role": "assistant",
                });

                let text = message.text();

                if !text.is_empty() {
                    converted["content"] = json!(text);
                }

                let calls: Vec<Value> = message
                    .tool_calls()
                    .iter()
                    .map(|call| {
                        let arguments = if call.arguments.is_empty() {
                            "{}"
                        } else {
                            call.arguments.as_str()
                        };

                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": arguments,
                            }
                        })
                    })
                    .collect();

                if !calls.is_empty() {
                    converted["tool_calls"] = json!(calls);
                }

                result.push(converted);
            }
            Role::Tool => {
                for content in &message.content {
                    if let Content::ToolResult(tool_result) = content {
                        result.push(json!({
                            "role": "tool",
                            "content": tool_result.data,
                            "tool_call_id": tool_result.call_id,
                        }));
                    }
                }
            }
        }
    }

    Ok(result)
}

/// Convert canonical tools to the openai tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if tool.name.is_empty() {
            continue;
        }

        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }

        let mut function = json!({
            "name": tool.name,
            "parameters": tool.parameters,
        });

        if !tool.description.is_empty() {
            function["description"] = json!(tool.description);
        }

        if let Some(strict) = tool.strict {
            function["strict"] = json!(strict);
        }

        result.push(json!({
            "type": "function",
            "function": function,
        }));
    }

    Ok(result)
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Buffers raw bytes and decodes text only at event boundaries, so a
/// multi-byte character split across network chunks arrives intact.
pub struct SseStream {
    inner: ByteStream,
    buffer: BytesMut,
}

impl SseStream {
    pub fn new(response: reqwest::Response) -> Self {
        Self::from_stream(Box::pin(response.bytes_stream()))
    }

    fn from_stream(inner: ByteStream) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
        }
    }

    /// The next complete event, or None at end of stream.
    pub async fn next_event(&mut self) -> Result<Option<SseEvent>> {
        loop {
            if let Some((end, next)) = find_event_boundary(&self.buffer) {
                let raw = self.buffer.split_to(next);

                if let Some(event) = parse_event(&String::from_utf8_lossy(&raw[..end])) {
                    return Ok(Some(event));
                }

                continue;
            }

            match self.inner.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => {
                    let raw = self.buffer.split_to(self.buffer.len());
                    return Ok(parse_event(&String::from_utf8_lossy(&raw)));
                }
            }
        }
    }
}

// Returns (event end, next event start), handling both \n\n and \r\n\r\n.
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find_bytes(buffer, b"\n\n").map(|i| (i, i + 2));
    let crlf = find_bytes(buffer, b"\r\n\r\n").map(|i| (i, i + 4));

    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 < b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data = Vec::new();

    for line in raw.lines() {
        let line = line.trim_end_matches('\r');

        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.trim_start().to_string());
        }
    }

    if data.is_empty() && event.is_none() {
        return None;
    }

    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// Incremental decoder for newline-delimited JSON bodies. Buffers raw
/// bytes and decodes per complete line, like [`SseStream`].
pub struct LineStream {
    inner: ByteStream,
    buffer: BytesMut,
}

impl LineStream {
    pub fn new(response: reqwest::Response) -> Self {
        Self::from_stream(Box::pin(response.bytes_stream()))
    }

    fn from_stream(inner: ByteStream) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
        }
    }

    /// The next non-empty line, or None at end of stream.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
                let raw = self.buffer.split_to(pos + 1);
                let line = String::from_utf8_lossy(&raw).trim().to_string();

                if line.is_empty() {
                    continue;
                }

                return Ok(Some(line));
            }

            match self.inner.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => {
                    let raw = self.buffer.split_to(self.buffer.len());
                    let line = String::from_utf8_lossy(&raw).trim().to_string();

                    if line.is_empty() {
                        return Ok(None);
                    }

                    return Ok(Some(line));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tool::ToolCall;

    #[test]
    fn test_messages_to_openai_spec() -> Result<()> {
        let messages = vec![
            Message::system().with_text("be brief"),
            Message::user().with_text("Hello"),
        ];

        let spec = messages_to_openai_spec(&messages)?;

        assert_eq!(spec.len(), 2);
        assert_eq!(spec[0]["role"], "system");
        assert_eq!(spec[0]["content"], "be brief");
        assert_eq!(spec[1]["role"], "user");
        assert_eq!(spec[1]["content"][0]["text"], "Hello");
        Ok(())
    }

    #[test]
    fn test_messages_to_openai_spec_tool_round() -> Result<()> {
        let messages = vec![
            Message::assistant().with_tool_call(ToolCall::new("c1", "example", "{\"p\":1}")),
            Message::tool().with_tool_result("c1", "42"),
        ];

        let spec = messages_to_openai_spec(&messages)?;

        assert_eq!(spec.len(), 2);
        assert_eq!(spec[0]["tool_calls"][0]["id"], "c1");
        assert_eq!(spec[0]["tool_calls"][0]["function"]["name"], "example");
        assert_eq!(spec[1]["role"], "tool");
        assert_eq!(spec[1]["tool_call_id"], "c1");
        assert_eq!(spec[1]["content"], "42");
        Ok(())
    }

    #[test]
    fn test_empty_call_arguments_become_object() -> Result<()> {
        let messages = vec![Message::assistant().with_tool_call(ToolCall::new("c1", "fn", ""))];

        let spec = messages_to_openai_spec(&messages)?;
        assert_eq!(spec[0]["tool_calls"][0]["function"]["arguments"], "{}");
        Ok(())
    }

    #[test]
    fn test_file_preserves_mime_and_bytes() -> Result<()> {
        let data = vec![137u8, 80, 78, 71, 13, 10, 26, 10];
        let file = FileContent {
            name: "shot.png".into(),
            mime_type: "image/png".into(),
            data: data.clone(),
        };

        let part = convert_file(&file, ImageFormat::OpenAi, IMAGE_MIME_TYPES)?;
        let url = part["image_url"]["url"].as_str().unwrap();

        let (prefix, encoded) = url.split_once(";base64,").unwrap();
        assert_eq!(prefix, "data:image/png");
        assert_eq!(BASE64.decode(encoded)?, data);

        let part = convert_file(&file, ImageFormat::Anthropic, IMAGE_MIME_TYPES)?;
        assert_eq!(part["source"]["media_type"], "image/png");
        assert_eq!(
            BASE64.decode(part["source"]["data"].as_str().unwrap())?,
            data
        );

        Ok(())
    }

    #[test]
    fn test_unsupported_mime_is_an_error() {
        let file = FileContent {
            name: "report.pdf".into(),
            mime_type: "application/pdf".into(),
            data: vec![1, 2, 3],
        };

        let result = convert_file(&file, ImageFormat::OpenAi, IMAGE_MIME_TYPES);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("unsupported content type"));
    }

    #[test]
    fn test_tools_to_openai_spec_duplicate() {
        let tool = Tool::new("t", "a tool", json!({"type": "object"}));
        let result = tools_to_openai_spec(&[tool.clone(), tool]);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Duplicate tool name"));
    }

    fn byte_stream(chunks: Vec<&'static [u8]>) -> ByteStream {
        Box::pin(futures::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok::<_, reqwest::Error>(Bytes::from_static(chunk))),
        ))
    }

    #[tokio::test]
    async fn test_sse_multibyte_char_split_across_chunks() -> Result<()> {
        // "é" is 0xc3 0xa9; the chunk boundary falls between the two bytes.
        let mut stream =
            SseStream::from_stream(byte_stream(vec![b"data: caf\xc3", b"\xa9 au lait\n\n"]));

        let event = stream.next_event().await?.unwrap();
        assert_eq!(event.data, "café au lait");
        assert_eq!(stream.next_event().await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_line_multibyte_char_split_across_chunks() -> Result<()> {
        let mut stream = LineStream::from_stream(byte_stream(vec![
            b"{\"text\":\"\xe6\x97",
            b"\xa5\xe6\x9c\xac\"}\n",
        ]));

        let line = stream.next_line().await?.unwrap();
        assert_eq!(line, "{\"text\":\"日本\"}");
        assert_eq!(stream.next_line().await?, None);

        Ok(())
    }

    #[test]
    fn test_parse_event() {
        let event = parse_event("event: message_start\ndata: {\"a\":1}").unwrap();
        assert_eq!(event.event.as_deref(), Some("message_start"));
        assert_eq!(event.data, "{\"a\":1}");

        let event = parse_event("data: one\ndata: two").unwrap();
        assert_eq!(event.event, None);
        assert_eq!(event.data, "one\ntwo");

        assert_eq!(parse_event(": keep-alive"), None);
    }
}
