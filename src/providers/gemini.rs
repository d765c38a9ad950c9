//! Google Gemini `generateContent` API.
//!
//! Instructions go to `systemInstruction`, sampling parameters to
//! `generationConfig`, and tools to `functionDeclarations`. Streaming uses
//! `streamGenerateContent?alt=sse`; each event carries cumulative usage and
//! there is no end sentinel, so completion is decided at end of input.

use std::collections::HashMap;

use serde_json::{Map, Value, json};

use crate::providers::adapter::{
    DecodedResponse, DecoderState, ProviderAdapter, ProviderFamily, StreamDecoder, StreamEvent,
    StreamFinal, WireRequest,
};
use crate::providers::registry::ProviderBinding;
use crate::providers::sse::SseEvent;
use crate::providers::types::{
    ChatMessage, ChatRequest, ChatResponse, Choice, ContentPart, FunctionCall, FunctionCallDelta,
    MessageContent, MessageRole, ResponseMessage, TokenCounts, ToolCall, ToolCallDelta,
};
use crate::providers::util::{self, ImageSource, reject_if};
use crate::providers::ProviderError;

const PROVIDER: &str = "gemini";

pub struct GeminiAdapter;

impl ProviderAdapter for GeminiAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Gemini
    }

    fn encode_request(
        &self,
        request: &ChatRequest,
        binding: &ProviderBinding,
    ) -> Result<WireRequest, ProviderError> {
        check_supported(request)?;

        let mut body = json!({ "contents": convert_contents(&request.messages) });
        if let Some(system) = util::collect_instructions(&request.messages) {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        let config = generation_config(request)?;
        if !config.is_empty() {
            body["generationConfig"] = Value::Object(config);
        }
        if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
            body["tools"] = util::tools_to_gemini(tools);
            if let Some(config) = util::tool_choice_to_gemini(request.tool_choice.as_ref()) {
                body["toolConfig"] = config;
            }
        }

        let url = if request.stream {
            binding.endpoint(&format!(
                "models/{}:streamGenerateContent?alt=sse",
                binding.upstream_model
            ))
        } else {
            binding.endpoint(&format!("models/{}:generateContent", binding.upstream_model))
        };

        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        if !binding.credential.is_empty() {
            headers.push((
                "x-goog-api-key".to_string(),
                binding.credential.expose().to_string(),
            ));
        }
        headers.extend(binding.headers.iter().cloned());

        Ok(WireRequest {
            url,
            headers,
            body,
            stream: request.stream,
        })
    }

    fn decode_response(
        &self,
        body: &[u8],
        binding: &ProviderBinding,
    ) -> Result<DecodedResponse, ProviderError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ProviderError::protocol(format!("unparsable generateContent body: {e}"), body))?;

        let choices = match value.get("candidates").and_then(Value::as_array) {
            Some(candidates) => candidates
                .iter()
                .enumerate()
                .map(|(i, candidate)| {
                    let (text, calls) = candidate_parts(candidate);
                    Choice {
                        index: candidate["index"]
                            .as_u64()
                            .and_then(|v| u32::try_from(v).ok())
                            .unwrap_or(u32::try_from(i).unwrap_or_default()),
                        message: ResponseMessage {
                            role: "assistant".to_string(),
                            content: (!text.is_empty()).then_some(text),
                            tool_calls: finish_tool_calls(calls),
                        },
                        finish_reason: candidate_finish(candidate),
                    }
                })
                .collect(),
            None if value["promptFeedback"]["blockReason"].is_string() => vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: None,
                    tool_calls: None,
                },
                finish_reason: Some("content_filter".to_string()),
            }],
            None => {
                return Err(ProviderError::protocol(
                    "generateContent body has no candidates",
                    body,
                ));
            }
        };

        let reported_usage = value.get("usageMetadata").map(|u| {
            let (input, output) = usage_counts(u);
            TokenCounts::new(input.unwrap_or(0), output.unwrap_or(0))
        });

        Ok(DecodedResponse {
            response: ChatResponse {
                id: response_id(&value),
                object: "chat.completion".to_string(),
                created: chrono::Utc::now().timestamp(),
                model: binding.model.clone(),
                choices,
                usage: reported_usage.unwrap_or_default().to_usage(),
            },
            reported_usage,
        })
    }

    fn stream_decoder(
        &self,
        _binding: &ProviderBinding,
        prompt_estimate: u32,
    ) -> Box<dyn StreamDecoder> {
        Box::new(GenerateStreamDecoder {
            state: DecoderState::new(
                format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
                prompt_estimate,
            ),
            id_seen: false,
            tool_calls: 0,
        })
    }
}

fn check_supported(request: &ChatRequest) -> Result<(), ProviderError> {
    reject_if(request.logit_bias.is_some(), "logit_bias", PROVIDER)?;
    reject_if(
        request.logprobs == Some(true) || request.top_logprobs.is_some(),
        "logprobs",
        PROVIDER,
    )?;
    reject_if(
        request.stream && request.n.is_some_and(|n| n > 1),
        "n with stream",
        PROVIDER,
    )?;
    util::reject_function_role(request, PROVIDER)?;
    util::reject_unknown_fields(request, PROVIDER)
}

fn generation_config(request: &ChatRequest) -> Result<Map<String, Value>, ProviderError> {
    let mut config = Map::new();
    if let Some(t) = request.temperature {
        config.insert("temperature".into(), json!(t));
    }
    if let Some(p) = request.top_p {
        config.insert("topP".into(), json!(p));
    }
    if let Some(max) = request.requested_max_tokens() {
        config.insert("maxOutputTokens".into(), json!(max));
    }
    if let Some(stop) = &request.stop {
        config.insert("stopSequences".into(), json!(stop.to_vec()));
    }
    if let Some(n) = request.n {
        config.insert("candidateCount".into(), json!(n));
    }
    if let Some(p) = request.presence_penalty {
        config.insert("presencePenalty".into(), json!(p));
    }
    if let Some(p) = request.frequency_penalty {
        config.insert("frequencyPenalty".into(), json!(p));
    }
    if let Some(seed) = request.seed {
        config.insert("seed".into(), json!(seed));
    }
    if let Some(effort) = &request.reasoning_effort {
        let budget = match effort.as_str() {
            "none" | "minimal" => 0,
            "low" => 1024,
            "medium" => 8192,
            "high" => 24576,
            other => {
                return Err(ProviderError::UnsupportedFeature(format!(
                    "reasoning_effort '{other}' is not supported by gemini models"
                )));
            }
        };
        config.insert("thinkingConfig".into(), json!({"thinkingBudget": budget}));
    }
    if let Some(format) = &request.response_format {
        match format.get("type").and_then(Value::as_str) {
            Some("text") | None => {}
            Some("json_object") => {
                config.insert("responseMimeType".into(), json!("application/json"));
            }
            Some("json_schema") => {
                config.insert("responseMimeType".into(), json!("application/json"));
                if let Some(schema) = format.get("json_schema").and_then(|s| s.get("schema")) {
                    config.insert("responseSchema".into(), schema.clone());
                }
            }
            Some(other) => {
                return Err(ProviderError::UnsupportedFeature(format!(
                    "response_format '{other}' is not supported by gemini models"
                )));
            }
        }
    }
    Ok(config)
}

// MARK: - Contents

fn convert_contents(messages: &[ChatMessage]) -> Vec<Value> {
    // functionResponse needs the function name; tool messages only carry the id.
    let call_names: HashMap<&str, &str> = messages
        .iter()
        .flat_map(|m| m.tool_calls.iter().flatten())
        .map(|c| (c.id.as_str(), c.function.name.as_str()))
        .collect();

    let mut contents: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for msg in messages.iter().filter(|m| !m.role.is_instruction()) {
        let (role, parts) = match msg.role {
            MessageRole::Assistant => {
                let mut parts = msg.content.as_ref().map(content_parts).unwrap_or_default();
                for call in msg.tool_calls.iter().flatten() {
                    let args: Value =
                        serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
                    parts.push(json!({"functionCall": {"name": call.function.name, "args": args}}));
                }
                ("model", parts)
            }
            MessageRole::Tool => {
                let name = msg
                    .name
                    .as_deref()
                    .or_else(|| msg.tool_call_id.as_deref().and_then(|id| call_names.get(id).copied()))
                    .unwrap_or("function");
                let text = msg.text_content();
                let response = serde_json::from_str::<Value>(&text)
                    .ok()
                    .filter(Value::is_object)
                    .unwrap_or_else(|| json!({"result": text}));
                (
                    "user",
                    vec![json!({"functionResponse": {"name": name, "response": response}})],
                )
            }
            _ => ("user", msg.content.as_ref().map(content_parts).unwrap_or_default()),
        };

        match contents.last_mut() {
            Some((last_role, last_parts)) if *last_role == role => last_parts.extend(parts),
            _ => contents.push((role, parts)),
        }
    }

    contents
        .into_iter()
        .map(|(role, mut parts)| {
            if parts.is_empty() {
                parts.push(json!({"text": ""}));
            }
            json!({"role": role, "parts": parts})
        })
        .collect()
}

fn content_parts(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(text) => vec![json!({"text": text})],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"text": text}),
                ContentPart::ImageUrl { image_url } => match util::parse_image_url(&image_url.url) {
                    ImageSource::Inline { media_type, data } => {
                        json!({"inlineData": {"mimeType": media_type, "data": data}})
                    }
                    ImageSource::Remote { url } => {
                        json!({"fileData": {"mimeType": guess_mime(&url), "fileUri": url}})
                    }
                },
            })
            .collect(),
    }
}

fn guess_mime(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        "image/jpeg"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else {
        "image/png"
    }
}

// MARK: - Response parsing

fn response_id(value: &Value) -> String {
    value["responseId"]
        .as_str()
        .map(|id| format!("chatcmpl-{id}"))
        .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()))
}

/// Text and `(name, args)` function calls of one candidate. Thought parts
/// are skipped.
fn candidate_parts(candidate: &Value) -> (String, Vec<(String, String)>) {
    let mut text = String::new();
    let mut calls = Vec::new();
    for part in candidate["content"]["parts"].as_array().into_iter().flatten() {
        if part["thought"].as_bool() == Some(true) {
            continue;
        }
        if let Some(t) = part["text"].as_str() {
            text.push_str(t);
        } else if let Some(call) = part.get("functionCall") {
            let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            calls.push((
                call["name"].as_str().unwrap_or_default().to_string(),
                serde_json::to_string(&args).unwrap_or_else(|_| "{}".to_string()),
            ));
        }
    }
    (text, calls)
}

fn finish_tool_calls(calls: Vec<(String, String)>) -> Option<Vec<ToolCall>> {
    if calls.is_empty() {
        return None;
    }
    Some(
        calls
            .into_iter()
            .map(|(name, arguments)| ToolCall {
                id: new_call_id(),
                r#type: "function".to_string(),
                function: FunctionCall { name, arguments },
            })
            .collect(),
    )
}

fn new_call_id() -> String {
    format!("call_{}", &uuid::Uuid::new_v4().simple().to_string()[..24])
}

fn candidate_finish(candidate: &Value) -> Option<String> {
    let reason = candidate["finishReason"].as_str()?;
    let has_calls = candidate["content"]["parts"]
        .as_array()
        .is_some_and(|parts| parts.iter().any(|p| p.get("functionCall").is_some()));
    // Gemini reports STOP even when it answered with a function call.
    if has_calls && reason == "STOP" {
        Some("tool_calls".to_string())
    } else {
        Some(util::map_finish_reason(reason).to_string())
    }
}

/// `(input, output)` from `usageMetadata`; output includes thinking tokens.
fn usage_counts(usage: &Value) -> (Option<u32>, Option<u32>) {
    let field = |key: &str| {
        usage[key]
            .as_u64()
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
    };
    let output = match (field("candidatesTokenCount"), field("thoughtsTokenCount")) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0))),
    };
    (field("promptTokenCount"), output)
}

// MARK: - Streaming

struct GenerateStreamDecoder {
    state: DecoderState,
    id_seen: bool,
    tool_calls: u32,
}

impl StreamDecoder for GenerateStreamDecoder {
    fn decode_event(&mut self, event: &SseEvent) -> Result<Vec<StreamEvent>, ProviderError> {
        let SseEvent::Data { data, .. } = event else {
            return Ok(Vec::new());
        };
        let value: Value = serde_json::from_str(data)
            .map_err(|e| ProviderError::protocol(format!("unparsable stream event: {e}"), data))?;
        if let Some(error) = value.get("error") {
            let message = error["message"].as_str().unwrap_or("upstream stream error");
            return Err(ProviderError::Stream(message.to_string()));
        }

        if !self.id_seen && value["responseId"].is_string() {
            self.state.id = response_id(&value);
            self.id_seen = true;
        }
        if let Some(usage) = value.get("usageMetadata") {
            let (input, output) = usage_counts(usage);
            self.state.tally.report(input, output);
        }

        let mut events = Vec::new();
        if let Some(candidate) = value["candidates"].get(0) {
            let (text, calls) = candidate_parts(candidate);
            let tool_calls: Vec<ToolCallDelta> = calls
                .into_iter()
                .map(|(name, arguments)| {
                    let index = self.tool_calls;
                    self.tool_calls += 1;
                    ToolCallDelta {
                        index,
                        id: Some(new_call_id()),
                        r#type: Some("function".to_string()),
                        function: Some(FunctionCallDelta {
                            name: Some(name),
                            arguments: Some(arguments),
                        }),
                    }
                })
                .collect();
            let content = (!text.is_empty()).then_some(text);
            let tool_calls = (!tool_calls.is_empty()).then_some(tool_calls);
            if content.is_some() || tool_calls.is_some() {
                events.push(self.state.delta(content, tool_calls));
            }
            if let Some(reason) = candidate_finish(candidate) {
                let reason = if self.tool_calls > 0 && reason == "stop" {
                    "tool_calls".to_string()
                } else {
                    reason
                };
                self.state.finish_reason = Some(reason);
            }
        } else if value["promptFeedback"]["blockReason"].is_string() {
            self.state.finish_reason = Some("content_filter".to_string());
        }
        Ok(events)
    }

    fn end_of_input(&mut self) -> Option<StreamFinal> {
        self.state.end_if_finished()
    }

    fn partial_usage(&mut self) -> (TokenCounts, u32) {
        self.state.partial()
    }

    fn response_id(&self) -> &str {
        &self.state.id
    }
}
