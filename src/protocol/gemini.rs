use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::completion::{Completion, CompletionReason};
use crate::models::content::Content;

/// Builds a single `generateContent` response body. Streaming callers drive
/// the backend with internal streaming for accurate usage and finish reason,
/// accumulate, then serialize once.
pub fn generate_content_response(completion: &Completion, fallback_model: &str) -> Value {
    let model = if completion.model.is_empty() {
        fallback_model
    } else {
        &completion.model
    };

    let mut result = json!({
        "responseId": format!("resp_{}", Uuid::new_v4().simple()),
        "modelVersion": model,
    });

    if let Some(usage) = &completion.usage {
        result["usageMetadata"] = json!({
            "promptTokenCount": usage.input_tokens,
            "candidatesTokenCount": usage.output_tokens,
            "totalTokenCount": usage.total(),
        });
    }

    if let Some(message) = &completion.message {
        let mut parts = Vec::new();
        let mut has_calls = false;

        for content in &message.content {
            match content {
                Content::Text(text) => {
                    parts.push(json!({"text": text.text}));
                }
                Content::ToolCall(call) => {
                    has_calls = true;

                    let args: Value =
                        serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));

                    parts.push(json!({
                        "functionCall": {
                            "name": call.name,
                            "args": args,
                        },
                    }));
                }
                _ => {}
            }
        }

        let finish_reason = if has_calls {
            "STOP"
        } else {
            to_finish_reason(completion.reason.unwrap_or(CompletionReason::Stop))
        };

        result["candidates"] = json!([{
            "content": {"role": "model", "parts": parts},
            "finishReason": finish_reason,
            "index": 0,
        }]);
    }

    result
}

fn to_finish_reason(reason: CompletionReason) -> &'static str {
    match reason {
        CompletionReason::Stop | CompletionReason::Tool => "STOP",
        CompletionReason::Length => "MAX_TOKENS",
        CompletionReason::Filter => "SAFETY",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::completion::Usage;
    use crate::models::message::Message;
    use crate::models::tool::ToolCall;

    #[test]
    fn test_text_candidate() {
        let completion = Completion {
            id: "c1".to_string(),
            model: "m".to_string(),
            reason: Some(CompletionReason::Stop),
            message: Some(Message::assistant().with_text("Hello")),
            usage: Some(Usage::new(2, 3)),
        };

        let body = generate_content_response(&completion, "fallback");

        assert_eq!(body["modelVersion"], "m");
        assert_eq!(body["candidates"][0]["content"]["parts"][0]["text"], "Hello");
        assert_eq!(body["candidates"][0]["finishReason"], "STOP");
        assert_eq!(body["usageMetadata"]["totalTokenCount"], 5);
    }

    #[test]
    fn test_function_call_part() {
        let completion = Completion {
            id: "c1".to_string(),
            reason: Some(CompletionReason::Tool),
            message: Some(
                Message::assistant().with_tool_call(ToolCall::new("t1", "lookup", "{\"q\":\"x\"}")),
            ),
            ..Default::default()
        };

        let body = generate_content_response(&completion, "gemini-test");

        assert_eq!(body["modelVersion"], "gemini-test");

        let part = &body["candidates"][0]["content"]["parts"][0];
        assert_eq!(part["functionCall"]["name"], "lookup");
        assert_eq!(part["functionCall"]["args"], json!({"q": "x"}));
    }

    #[test]
    fn test_length_maps_to_max_tokens() {
        let completion = Completion {
            id: "c1".to_string(),
            reason: Some(CompletionReason::Length),
            message: Some(Message::assistant().with_text("partial")),
            ..Default::default()
        };

        let body = generate_content_response(&completion, "m");
        assert_eq!(body["candidates"][0]["finishReason"], "MAX_TOKENS");
    }
}
