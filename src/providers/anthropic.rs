//! Anthropic Messages API.
//!
//! Instructions are lifted into the top-level `system` field, tool results
//! become `tool_result` blocks on a user turn, and consecutive turns of the
//! same role are merged because the upstream requires strict alternation.

use std::collections::HashMap;

use serde_json::{Value, json};

use crate::providers::adapter::{
    DecodedResponse, DecoderState, ProviderAdapter, ProviderFamily, StreamDecoder, StreamEvent,
    StreamFinal, WireRequest,
};
use crate::providers::registry::ProviderBinding;
use crate::providers::sse::SseEvent;
use crate::providers::types::{
    ChatMessage, ChatRequest, ChatResponse, Choice, ContentPart, MessageContent, MessageRole,
    ResponseMessage, TokenCounts, ToolCall, ToolCallDelta,
};
use crate::providers::util::{self, ImageSource, reject_if};
use crate::providers::ProviderError;

pub const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const PROVIDER: &str = "anthropic";

pub struct AnthropicAdapter;

impl ProviderAdapter for AnthropicAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    fn encode_request(
        &self,
        request: &ChatRequest,
        binding: &ProviderBinding,
    ) -> Result<WireRequest, ProviderError> {
        check_supported(request)?;

        let mut body = json!({
            "model": binding.upstream_model,
            "max_tokens": request
                .requested_max_tokens()
                .or(binding.max_output_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": convert_messages(&request.messages),
        });

        if let Some(system) = util::collect_instructions(&request.messages) {
            body["system"] = Value::String(system);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = request.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(stop) = &request.stop {
            body["stop_sequences"] = json!(stop.to_vec());
        }
        if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
            body["tools"] = Value::Array(util::tools_to_anthropic(tools));
            if let Some(choice) =
                util::tool_choice_to_anthropic(request.tool_choice.as_ref(), request.parallel_tool_calls)
            {
                body["tool_choice"] = choice;
            }
        }
        if let Some(user) = &request.user {
            body["metadata"] = json!({"user_id": user});
        }
        if request.stream {
            body["stream"] = Value::Bool(true);
        }

        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("anthropic-version".to_string(), API_VERSION.to_string()),
        ];
        if !binding.credential.is_empty() {
            headers.push(("x-api-key".to_string(), binding.credential.expose().to_string()));
        }
        headers.extend(binding.headers.iter().cloned());

        Ok(WireRequest {
            url: binding.endpoint("messages"),
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
            .map_err(|e| ProviderError::protocol(format!("unparsable messages body: {e}"), body))?;
        let Some(blocks) = value.get("content").and_then(Value::as_array) else {
            return Err(ProviderError::protocol("messages body has no content array", body));
        };

        let mut text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
                Some("tool_use") => tool_calls.push(util::tool_use_to_call(
                    block["id"].as_str().unwrap_or_default(),
                    block["name"].as_str().unwrap_or_default(),
                    &block["input"],
                )),
                _ => {}
            }
        }

        let finish_reason = value["stop_reason"]
            .as_str()
            .map(|r| util::map_finish_reason(r).to_string());
        let reported_usage = value.get("usage").map(|u| {
            TokenCounts::new(input_tokens(u), u32_field(u, "output_tokens").unwrap_or(0))
        });

        Ok(DecodedResponse {
            response: ChatResponse {
                id: value["id"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
                object: "chat.completion".to_string(),
                created: chrono::Utc::now().timestamp(),
                model: binding.model.clone(),
                choices: vec![Choice {
                    index: 0,
                    message: ResponseMessage {
                        role: "assistant".to_string(),
                        content: (!text.is_empty()).then_some(text),
                        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    },
                    finish_reason,
                }],
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
        Box::new(MessagesStreamDecoder {
            state: DecoderState::new(
                format!("msg_{}", uuid::Uuid::new_v4().simple()),
                prompt_estimate,
            ),
            tool_slots: HashMap::new(),
        })
    }
}

fn check_supported(request: &ChatRequest) -> Result<(), ProviderError> {
    reject_if(request.n.is_some_and(|n| n > 1), "n", PROVIDER)?;
    reject_if(request.presence_penalty.is_some(), "presence_penalty", PROVIDER)?;
    reject_if(request.frequency_penalty.is_some(), "frequency_penalty", PROVIDER)?;
    reject_if(request.logit_bias.is_some(), "logit_bias", PROVIDER)?;
    reject_if(
        request.logprobs == Some(true) || request.top_logprobs.is_some(),
        "logprobs",
        PROVIDER,
    )?;
    reject_if(request.seed.is_some(), "seed", PROVIDER)?;
    reject_if(request.reasoning_effort.is_some(), "reasoning_effort", PROVIDER)?;
    let non_text_format = request
        .response_format
        .as_ref()
        .and_then(|f| f.get("type"))
        .and_then(Value::as_str)
        .is_some_and(|t| t != "text");
    reject_if(non_text_format, "response_format", PROVIDER)?;
    util::reject_function_role(request, PROVIDER)?;
    util::reject_unknown_fields(request, PROVIDER)
}

// MARK: - Messages

fn convert_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for msg in messages.iter().filter(|m| !m.role.is_instruction()) {
        let (role, blocks) = match msg.role {
            MessageRole::Tool => (
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": util::sanitize_tool_call_id(msg.tool_call_id.as_deref().unwrap_or_default()),
                    "content": msg.text_content(),
                })],
            ),
            MessageRole::Assistant => {
                let mut blocks = msg.content.as_ref().map(content_blocks).unwrap_or_default();
                for call in msg.tool_calls.iter().flatten() {
                    let input: Value =
                        serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": util::sanitize_tool_call_id(&call.id),
                        "name": call.function.name,
                        "input": input,
                    }));
                }
                ("assistant", blocks)
            }
            _ => ("user", msg.content.as_ref().map(content_blocks).unwrap_or_default()),
        };

        match turns.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => turns.push((role, blocks)),
        }
    }

    turns
        .into_iter()
        .map(|(role, mut blocks)| {
            // Empty turns are rejected upstream.
            if blocks.is_empty() {
                blocks.push(json!({"type": "text", "text": " "}));
            }
            json!({"role": role, "content": blocks})
        })
        .collect()
}

fn content_blocks(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(text) if text.is_empty() => Vec::new(),
        MessageContent::Text(text) => vec![json!({"type": "text", "text": text})],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } if text.is_empty() => None,
                ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
                ContentPart::ImageUrl { image_url } => Some(match util::parse_image_url(&image_url.url) {
                    ImageSource::Inline { media_type, data } => json!({
                        "type": "image",
                        "source": {"type": "base64", "media_type": media_type, "data": data},
                    }),
                    ImageSource::Remote { url } => json!({
                        "type": "image",
                        "source": {"type": "url", "url": url},
                    }),
                }),
            })
            .collect(),
    }
}

fn u32_field(value: &Value, key: &str) -> Option<u32> {
    value
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
}

/// Input tokens including cache reads and writes.
fn input_tokens(usage: &Value) -> u32 {
    ["input_tokens", "cache_creation_input_tokens", "cache_read_input_tokens"]
        .iter()
        .filter_map(|k| u32_field(usage, k))
        .fold(0, u32::saturating_add)
}

// MARK: - Streaming

struct MessagesStreamDecoder {
    state: DecoderState,
    /// Content block index to tool call index.
    tool_slots: HashMap<u64, u32>,
}

impl StreamDecoder for MessagesStreamDecoder {
    fn decode_event(&mut self, event: &SseEvent) -> Result<Vec<StreamEvent>, ProviderError> {
        let SseEvent::Data { data, .. } = event else {
            return Ok(Vec::new());
        };
        let value: Value = serde_json::from_str(data)
            .map_err(|e| ProviderError::protocol(format!("unparsable stream event: {e}"), data))?;

        let mut events = Vec::new();
        match value["type"].as_str().unwrap_or_default() {
            "message_start" => {
                let message = &value["message"];
                if let Some(id) = message["id"].as_str() {
                    self.state.id = id.to_string();
                }
                if let Some(usage) = message.get("usage") {
                    self.state
                        .tally
                        .report(Some(input_tokens(usage)), u32_field(usage, "output_tokens"));
                }
            }
            "content_block_start" => {
                let block = &value["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let slot = u32::try_from(self.tool_slots.len()).unwrap_or(u32::MAX);
                    self.tool_slots
                        .insert(value["index"].as_u64().unwrap_or_default(), slot);
                    let start = ToolCallDelta::start(
                        slot,
                        block["id"].as_str().unwrap_or_default(),
                        block["name"].as_str().unwrap_or_default(),
                    );
                    events.push(self.state.delta(None, Some(vec![start])));
                } else if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                    events.push(self.state.delta(Some(text.to_string()), None));
                }
            }
            "content_block_delta" => {
                let delta = &value["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        if !text.is_empty() {
                            events.push(self.state.delta(Some(text.to_string()), None));
                        }
                    }
                    Some("input_json_delta") => {
                        let index = value["index"].as_u64().unwrap_or_default();
                        let partial = delta["partial_json"].as_str().unwrap_or_default();
                        if let Some(slot) = self.tool_slots.get(&index).copied() {
                            if !partial.is_empty() {
                                let args = ToolCallDelta::arguments(slot, partial);
                                events.push(self.state.delta(None, Some(vec![args])));
                            }
                        }
                    }
                    // thinking and signature deltas are not forwarded
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = value["delta"]["stop_reason"].as_str() {
                    self.state.finish_reason = Some(util::map_finish_reason(reason).to_string());
                }
                if let Some(usage) = value.get("usage") {
                    let input = u32_field(usage, "input_tokens").map(|_| input_tokens(usage));
                    self.state.tally.report(input, u32_field(usage, "output_tokens"));
                }
            }
            "message_stop" => events.extend(self.state.end().map(StreamEvent::End)),
            "error" => {
                let message = value["error"]["message"]
                    .as_str()
                    .unwrap_or("upstream stream error");
                return Err(ProviderError::Stream(message.to_string()));
            }
            _ => {}
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::registry::Secret;
    use crate::providers::types::{FunctionCall, ImageUrl, Tool, FunctionDef};

    fn binding() -> ProviderBinding {
        let mut binding =
            ProviderBinding::new("claude", ProviderFamily::Anthropic, "https://api.anthropic.com/v1");
        binding.upstream_model = "claude-sonnet-4-20250514".into();
        binding.credential = Secret::new("sk-ant");
        binding.max_output_tokens = Some(8192);
        binding
    }

    fn request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest::new("claude", messages)
    }

    #[test]
    fn test_encode_lifts_instructions_and_sets_headers() {
        let req = request(vec![
            ChatMessage::system("Be terse."),
            ChatMessage::text(MessageRole::Developer, "No emoji."),
            ChatMessage::user("Hello!"),
        ]);
        let wire = AnthropicAdapter.encode_request(&req, &binding()).unwrap();
        assert_eq!(wire.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(wire.header("x-api-key"), Some("sk-ant"));
        assert_eq!(wire.header("anthropic-version"), Some(API_VERSION));
        assert_eq!(wire.body["system"], "Be terse.\n\nNo emoji.");
        assert_eq!(wire.body["max_tokens"], 8192);
        assert_eq!(wire.body["model"], "claude-sonnet-4-20250514");
        assert_eq!(wire.body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_encode_merges_tool_results_into_user_turn() {
        let mut assistant = ChatMessage::assistant("");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "call.1".into(),
            r#type: "function".into(),
            function: FunctionCall {
                name: "weather".into(),
                arguments: "{\"city\":\"Oslo\"}".into(),
            },
        }]);
        let mut tool = ChatMessage::text(MessageRole::Tool, "sunny");
        tool.tool_call_id = Some("call.1".into());

        let req = request(vec![
            ChatMessage::user("weather?"),
            assistant,
            tool,
            ChatMessage::user("thanks"),
        ]);
        let wire = AnthropicAdapter.encode_request(&req, &binding()).unwrap();
        let messages = wire.body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[1]["content"][0]["id"], "call_1");
        assert_eq!(messages[1]["content"][0]["input"]["city"], "Oslo");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][1]["text"], "thanks");
    }

    #[test]
    fn test_encode_maps_stop_tools_and_images() {
        let mut req = request(vec![ChatMessage {
            role: MessageRole::User,
            content: Some(MessageContent::Parts(vec![
                ContentPart::Text { text: "what is this".into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: "data:image/png;base64,iVBOR".into(),
                        detail: None,
                    },
                },
            ])),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }]);
        req.stop = Some(crate::providers::types::StopSequence::Single("END".into()));
        req.tools = Some(vec![Tool {
            r#type: "function".into(),
            function: FunctionDef {
                name: "lookup".into(),
                description: None,
                parameters: None,
            },
        }]);
        req.tool_choice = Some(json!("required"));

        let wire = AnthropicAdapter.encode_request(&req, &binding()).unwrap();
        assert_eq!(wire.body["stop_sequences"], json!(["END"]));
        assert_eq!(wire.body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(wire.body["tool_choice"]["type"], "any");
        let image = &wire.body["messages"][0]["content"][1];
        assert_eq!(image["source"]["media_type"], "image/png");
    }

    #[test]
    fn test_unsupported_parameters_rejected() {
        let cases: Vec<Box<dyn Fn(&mut ChatRequest)>> = vec![
            Box::new(|r: &mut ChatRequest| r.presence_penalty = Some(0.5)),
            Box::new(|r: &mut ChatRequest| r.frequency_penalty = Some(0.5)),
            Box::new(|r: &mut ChatRequest| r.seed = Some(7)),
            Box::new(|r: &mut ChatRequest| r.n = Some(2)),
            Box::new(|r: &mut ChatRequest| r.logprobs = Some(true)),
            Box::new(|r: &mut ChatRequest| r.logit_bias = Some(json!({}))),
            Box::new(|r: &mut ChatRequest| r.response_format = Some(json!({"type": "json_object"}))),
            Box::new(|r: &mut ChatRequest| {
                r.extra.insert("prediction".into(), json!({}));
            }),
            Box::new(|r: &mut ChatRequest| r.messages.push(ChatMessage::text(MessageRole::Function, "x"))),
        ];
        for mutate in cases {
            let mut req = request(vec![ChatMessage::user("hi")]);
            mutate(&mut req);
            assert!(matches!(
                AnthropicAdapter.encode_request(&req, &binding()),
                Err(ProviderError::UnsupportedFeature(_))
            ));
        }
        let mut req = request(vec![ChatMessage::user("hi")]);
        req.response_format = Some(json!({"type": "text"}));
        req.n = Some(1);
        assert!(AnthropicAdapter.encode_request(&req, &binding()).is_ok());
    }

    #[test]
    fn test_decode_text_and_tool_use() {
        let body = br#"{"id":"msg_1","type":"message","role":"assistant",
            "content":[{"type":"text","text":"Checking."},{"type":"tool_use","id":"toolu_1","name":"weather","input":{"city":"Oslo"}}],
            "stop_reason":"tool_use","usage":{"input_tokens":20,"cache_read_input_tokens":5,"output_tokens":11}}"#;
        let decoded = AnthropicAdapter.decode_response(body, &binding()).unwrap();
        let choice = &decoded.response.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("Checking."));
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        let call = &choice.message.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.function.arguments, "{\"city\":\"Oslo\"}");
        assert_eq!(decoded.reported_usage, Some(TokenCounts::new(25, 11)));
        assert_eq!(decoded.response.model, "claude");
    }

    #[test]
    fn test_decode_missing_content_is_protocol_error() {
        let err = AnthropicAdapter
            .decode_response(br#"{"type":"message"}"#, &binding())
            .unwrap_err();
        assert!(matches!(err, ProviderError::Protocol { .. }));
    }

    fn feed(decoder: &mut dyn StreamDecoder, events: &[&str]) -> Vec<StreamEvent> {
        events
            .iter()
            .flat_map(|data| decoder.decode_event(&SseEvent::data(*data)).unwrap())
            .collect()
    }

    #[test]
    fn test_stream_full_exchange() {
        let mut decoder = AnthropicAdapter.stream_decoder(&binding(), 3);
        let events = feed(
            decoder.as_mut(),
            &[
                r#"{"type":"message_start","message":{"id":"msg_9","usage":{"input_tokens":12,"output_tokens":1}}}"#,
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
                r#"{"type":"ping"}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" there"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":6}}"#,
                r#"{"type":"message_stop"}"#,
            ],
        );
        assert_eq!(decoder.response_id(), "msg_9");
        assert_eq!(events.len(), 3);
        let deltas: u32 = events
            .iter()
            .map(|e| match e {
                StreamEvent::Delta(d) => d.output_tokens,
                StreamEvent::End(f) => f.output_tokens,
            })
            .sum();
        let StreamEvent::End(end) = &events[2] else {
            panic!("expected end");
        };
        assert_eq!(end.usage, TokenCounts::new(12, 6));
        assert_eq!(end.finish_reason, "stop");
        assert_eq!(deltas, 6);
    }

    #[test]
    fn test_stream_tool_use_fragments() {
        let mut decoder = AnthropicAdapter.stream_decoder(&binding(), 3);
        let events = feed(
            decoder.as_mut(),
            &[
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"weather","input":{}}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"city\":"}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"Oslo\"}"}}"#,
            ],
        );
        let calls: Vec<ToolCallDelta> = events
            .into_iter()
            .filter_map(|e| match e {
                StreamEvent::Delta(d) => d.tool_calls,
                StreamEvent::End(_) => None,
            })
            .flatten()
            .collect();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].id.as_deref(), Some("toolu_1"));
        assert!(calls.iter().all(|c| c.index == 0));
        let args: String = calls
            .iter()
            .filter_map(|c| c.function.as_ref()?.arguments.clone())
            .collect();
        assert_eq!(args, "{\"city\":\"Oslo\"}");
    }

    #[test]
    fn test_stream_error_event() {
        let mut decoder = AnthropicAdapter.stream_decoder(&binding(), 3);
        let err = decoder
            .decode_event(&SseEvent::data(
                r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            ))
            .unwrap_err();
        assert!(matches!(err, ProviderError::Stream(m) if m == "Overloaded"));
    }
}
