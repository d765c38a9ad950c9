//! Conversion helpers shared by the native (non-OpenAI) adapters.

use serde_json::{Value, json};

use crate::providers::ProviderError;
use crate::providers::types::{ChatMessage, ChatRequest, FunctionCall, MessageRole, Tool, ToolCall};

// MARK: - Instructions

/// Join every system and developer message, in order, with a blank line.
pub fn collect_instructions(messages: &[ChatMessage]) -> Option<String> {
    let texts: Vec<String> = messages
        .iter()
        .filter(|m| m.role.is_instruction())
        .map(ChatMessage::text_content)
        .filter(|t| !t.is_empty())
        .collect();

    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n\n"))
    }
}

// MARK: - Feature checks

/// Reject a top-level field the upstream has no equivalent for.
pub fn reject_if(present: bool, field: &str, provider: &str) -> Result<(), ProviderError> {
    if present {
        Err(ProviderError::UnsupportedFeature(format!(
            "'{field}' is not supported by {provider} models"
        )))
    } else {
        Ok(())
    }
}

/// Reject fields that no native adapter can express.
pub fn reject_unknown_fields(request: &ChatRequest, provider: &str) -> Result<(), ProviderError> {
    match request.extra.keys().next() {
        Some(field) => reject_if(true, field, provider),
        None => Ok(()),
    }
}

/// Reject the legacy `function` role.
pub fn reject_function_role(request: &ChatRequest, provider: &str) -> Result<(), ProviderError> {
    reject_if(
        request.messages.iter().any(|m| m.role == MessageRole::Function),
        "function role",
        provider,
    )
}

// MARK: - Tools (Anthropic)

pub fn tools_to_anthropic(tools: &[Tool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let mut out = json!({
                "name": tool.function.name,
                "input_schema": tool
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            });
            if let Some(desc) = &tool.function.description {
                out["description"] = Value::String(desc.clone());
            }
            out
        })
        .collect()
}

/// `tool_choice` in Anthropic's shape. `None` leaves the upstream default.
pub fn tool_choice_to_anthropic(choice: Option<&Value>, parallel: Option<bool>) -> Option<Value> {
    let mut out = match choice? {
        Value::String(s) => match s.as_str() {
            "auto" => json!({"type": "auto"}),
            "required" => json!({"type": "any"}),
            "none" => json!({"type": "none"}),
            _ => return None,
        },
        Value::Object(obj) => {
            let name = obj.get("function")?.get("name")?.as_str()?;
            json!({"type": "tool", "name": name})
        }
        _ => return None,
    };
    if let Some(parallel) = parallel {
        out["disable_parallel_tool_use"] = Value::Bool(!parallel);
    }
    Some(out)
}

pub fn tool_use_to_call(id: &str, name: &str, input: &Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        r#type: "function".to_string(),
        function: FunctionCall {
            name: name.to_string(),
            arguments: serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()),
        },
    }
}

// MARK: - Tools (Gemini)

pub fn tools_to_gemini(tools: &[Tool]) -> Value {
    let declarations: Vec<Value> = tools
        .iter()
        .map(|tool| {
            let mut decl = json!({"name": tool.function.name});
            if let Some(desc) = &tool.function.description {
                decl["description"] = Value::String(desc.clone());
            }
            if let Some(params) = &tool.function.parameters {
                decl["parameters"] = params.clone();
            }
            decl
        })
        .collect();
    json!([{"functionDeclarations": declarations}])
}

pub fn tool_choice_to_gemini(choice: Option<&Value>) -> Option<Value> {
    let config = match choice? {
        Value::String(s) => match s.as_str() {
            "auto" => json!({"mode": "AUTO"}),
            "required" => json!({"mode": "ANY"}),
            "none" => json!({"mode": "NONE"}),
            _ => return None,
        },
        Value::Object(obj) => {
            let name = obj.get("function")?.get("name")?.as_str()?;
            json!({"mode": "ANY", "allowedFunctionNames": [name]})
        }
        _ => return None,
    };
    Some(json!({"functionCallingConfig": config}))
}

// MARK: - Misc

/// Anthropic tool ids must match `^[a-zA-Z0-9_-]+$`.
pub fn sanitize_tool_call_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// An image reference split into its transfer form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Inline { media_type: String, data: String },
    Remote { url: String },
}

pub fn parse_image_url(url: &str) -> ImageSource {
    if let Some(rest) = url.strip_prefix("data:") {
        let (header, data) = rest.split_once(',').unwrap_or((rest, ""));
        let media_type = header.split(';').next().filter(|m| !m.is_empty());
        ImageSource::Inline {
            media_type: media_type.unwrap_or("image/png").to_string(),
            data: data.to_string(),
        }
    } else {
        ImageSource::Remote {
            url: url.to_string(),
        }
    }
}

/// Map a native stop reason to the OpenAI vocabulary.
pub fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "end_turn" | "stop_sequence" | "STOP" | "stop" => "stop",
        "max_tokens" | "MAX_TOKENS" | "length" => "length",
        "tool_use" | "tool_calls" => "tool_calls",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
        | "refusal" | "content_filter" => "content_filter",
        _ => "stop",
    }
}

/// Truncate a raw payload for logging.
pub fn truncate_payload(payload: &str) -> String {
    const MAX: usize = 2048;
    if payload.len() <= MAX {
        return payload.to_string();
    }
    let mut end = MAX;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &payload[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_instructions_includes_developer() {
        let messages = vec![
            ChatMessage::system("one"),
            ChatMessage::user("hi"),
            ChatMessage::text(MessageRole::Developer, "two"),
        ];
        assert_eq!(collect_instructions(&messages).as_deref(), Some("one\n\ntwo"));
        assert_eq!(collect_instructions(&[ChatMessage::user("x")]), None);
    }

    #[test]
    fn test_tool_choice_anthropic() {
        assert_eq!(
            tool_choice_to_anthropic(Some(&json!("required")), None),
            Some(json!({"type": "any"}))
        );
        let named = json!({"type": "function", "function": {"name": "f"}});
        assert_eq!(
            tool_choice_to_anthropic(Some(&named), Some(false)),
            Some(json!({"type": "tool", "name": "f", "disable_parallel_tool_use": true}))
        );
        assert_eq!(tool_choice_to_anthropic(None, None), None);
    }

    #[test]
    fn test_tool_choice_gemini() {
        let named = json!({"type": "function", "function": {"name": "lookup"}});
        assert_eq!(
            tool_choice_to_gemini(Some(&named)),
            Some(json!({"functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": ["lookup"]}}))
        );
    }

    #[test]
    fn test_sanitize_tool_call_id() {
        assert_eq!(sanitize_tool_call_id("call.1:x"), "call_1_x");
    }

    #[test]
    fn test_parse_image_url() {
        assert_eq!(
            parse_image_url("data:image/jpeg;base64,AAAA"),
            ImageSource::Inline {
                media_type: "image/jpeg".into(),
                data: "AAAA".into()
            }
        );
        assert_eq!(
            parse_image_url("https://x/y.png"),
            ImageSource::Remote {
                url: "https://x/y.png".into()
            }
        );
    }

    #[test]
    fn test_map_finish_reason() {
        assert_eq!(map_finish_reason("end_turn"), "stop");
        assert_eq!(map_finish_reason("MAX_TOKENS"), "length");
        assert_eq!(map_finish_reason("tool_use"), "tool_calls");
        assert_eq!(map_finish_reason("SAFETY"), "content_filter");
    }

    #[test]
    fn test_reject_unknown_fields() {
        let mut req = ChatRequest::new("m", vec![ChatMessage::user("x")]);
        assert!(reject_unknown_fields(&req, "anthropic").is_ok());
        req.extra.insert("service_tier".into(), json!("auto"));
        let err = reject_unknown_fields(&req, "anthropic").unwrap_err();
        assert!(err.to_string().contains("service_tier"));
    }

    #[test]
    fn test_truncate_payload_respects_char_boundary() {
        let long = "\u{e9}".repeat(2000);
        let out = truncate_payload(&long);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 2051);
    }
}
