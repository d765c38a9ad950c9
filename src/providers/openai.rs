//! OpenAI chat completions wire protocol.
//!
//! The normalized schema is the OpenAI schema, so encoding is a pass-through
//! with the upstream model id substituted. The stream decoder is shared with
//! the aggregator adapter.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::providers::adapter::{
    DecodedResponse, DecoderState, ProviderAdapter, ProviderFamily, StreamDecoder, StreamEvent,
    StreamFinal, WireRequest,
};
use crate::providers::registry::ProviderBinding;
use crate::providers::sse::SseEvent;
use crate::providers::types::{
    ChatRequest, ChatResponse, Choice, ResponseMessage, TokenCounts, ToolCall, ToolCallDelta, Usage,
};
use crate::providers::ProviderError;

pub struct OpenAiAdapter;

impl ProviderAdapter for OpenAiAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAi
    }

    fn encode_request(
        &self,
        request: &ChatRequest,
        binding: &ProviderBinding,
    ) -> Result<WireRequest, ProviderError> {
        encode_chat_request(request, binding)
    }

    fn decode_response(
        &self,
        body: &[u8],
        binding: &ProviderBinding,
    ) -> Result<DecodedResponse, ProviderError> {
        decode_chat_response(body, binding)
    }

    fn stream_decoder(
        &self,
        _binding: &ProviderBinding,
        prompt_estimate: u32,
    ) -> Box<dyn StreamDecoder> {
        Box::new(ChatStreamDecoder::new(prompt_estimate))
    }
}

// MARK: - Encoding

/// OpenAI-shaped request for `binding`, with bearer auth and static headers.
pub fn encode_chat_request(
    request: &ChatRequest,
    binding: &ProviderBinding,
) -> Result<WireRequest, ProviderError> {
    if request.stream && request.n.is_some_and(|n| n > 1) {
        return Err(ProviderError::UnsupportedFeature(
            "'n' greater than 1 is not supported for streaming requests".to_string(),
        ));
    }

    let mut body = serde_json::to_value(request)
        .map_err(|e| ProviderError::UnsupportedFeature(format!("unencodable request: {e}")))?;
    body["model"] = Value::String(binding.upstream_model.clone());

    if request.stream {
        let mut options = request
            .stream_options
            .clone()
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({}));
        options["include_usage"] = Value::Bool(true);
        body["stream_options"] = options;
    } else if let Some(obj) = body.as_object_mut() {
        obj.remove("stream");
        obj.remove("stream_options");
    }

    let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
    if !binding.credential.is_empty() {
        headers.push((
            "authorization".to_string(),
            format!("Bearer {}", binding.credential.expose()),
        ));
    }
    headers.extend(binding.headers.iter().cloned());

    Ok(WireRequest {
        url: binding.endpoint("chat/completions"),
        headers,
        body,
        stream: request.stream,
    })
}

// MARK: - Decoding

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    index: u32,
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

pub fn decode_chat_response(
    body: &[u8],
    binding: &ProviderBinding,
) -> Result<DecodedResponse, ProviderError> {
    let wire: WireResponse = serde_json::from_slice(body)
        .map_err(|e| ProviderError::protocol(format!("unexpected chat completion body: {e}"), body))?;

    let choices = wire
        .choices
        .into_iter()
        .map(|c| Choice {
            index: c.index,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: c.message.content,
                tool_calls: c.message.tool_calls.filter(|t| !t.is_empty()),
            },
            finish_reason: c.finish_reason,
        })
        .collect();

    let reported_usage = wire.usage.map(TokenCounts::from);
    Ok(DecodedResponse {
        response: ChatResponse {
            id: wire
                .id
                .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())),
            object: "chat.completion".to_string(),
            created: wire.created.unwrap_or_else(|| chrono::Utc::now().timestamp()),
            model: binding.model.clone(),
            choices,
            usage: reported_usage.unwrap_or_default().to_usage(),
        },
        reported_usage,
    })
}

// MARK: - Streaming

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

/// Decoder for `chat.completion.chunk` streams.
pub struct ChatStreamDecoder {
    state: DecoderState,
    id_seen: bool,
}

impl ChatStreamDecoder {
    pub fn new(prompt_estimate: u32) -> Self {
        Self {
            state: DecoderState::new(
                format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
                prompt_estimate,
            ),
            id_seen: false,
        }
    }
}

impl StreamDecoder for ChatStreamDecoder {
    fn decode_event(&mut self, event: &SseEvent) -> Result<Vec<StreamEvent>, ProviderError> {
        let data = match event {
            SseEvent::Done => return Ok(self.state.end().into_iter().map(StreamEvent::End).collect()),
            SseEvent::Data { data, .. } => data,
        };

        let value: Value = serde_json::from_str(data)
            .map_err(|e| ProviderError::protocol(format!("unparsable stream chunk: {e}"), data))?;
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream stream error");
            return Err(ProviderError::Stream(message.to_string()));
        }
        let chunk: WireChunk = serde_json::from_value(value)
            .map_err(|e| ProviderError::protocol(format!("unexpected stream chunk: {e}"), data))?;

        if !self.id_seen {
            if let Some(id) = chunk.id.filter(|id| !id.is_empty()) {
                self.state.id = id;
                self.id_seen = true;
            }
        }
        if let Some(usage) = chunk.usage {
            self.state
                .tally
                .report(Some(usage.prompt_tokens), Some(usage.completion_tokens));
        }

        let mut events = Vec::new();
        if let Some(choice) = chunk.choices.into_iter().next() {
            let content = choice.delta.content.filter(|c| !c.is_empty());
            let tool_calls = choice.delta.tool_calls.filter(|t| !t.is_empty());
            if content.is_some() || tool_calls.is_some() {
                events.push(self.state.delta(content, tool_calls));
            }
            if let Some(reason) = choice.finish_reason {
                self.state.finish_reason = Some(reason);
            }
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
    use crate::providers::types::ChatMessage;

    fn binding() -> ProviderBinding {
        let mut binding =
            ProviderBinding::new("gpt-public", ProviderFamily::OpenAi, "https://api.openai.com/v1");
        binding.upstream_model = "gpt-4.1-2025-04-14".into();
        binding.credential = Secret::new("sk-upstream");
        binding
    }

    #[test]
    fn test_encode_substitutes_model_and_passes_fields() {
        let mut req = ChatRequest::new("gpt-public", vec![ChatMessage::user("Hello!")]);
        req.temperature = Some(0.2);
        req.logit_bias = Some(json!({"50256": -100}));
        req.extra.insert("service_tier".into(), json!("flex"));

        let wire = OpenAiAdapter.encode_request(&req, &binding()).unwrap();
        assert_eq!(wire.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(wire.header("Authorization"), Some("Bearer sk-upstream"));
        assert_eq!(wire.body["model"], "gpt-4.1-2025-04-14");
        assert_eq!(wire.body["logit_bias"]["50256"], -100);
        assert_eq!(wire.body["service_tier"], "flex");
        assert!(wire.body.get("stream").is_none());
    }

    #[test]
    fn test_encode_stream_requests_usage() {
        let mut req = ChatRequest::new("gpt-public", vec![ChatMessage::user("hi")]);
        req.stream = true;
        let wire = OpenAiAdapter.encode_request(&req, &binding()).unwrap();
        assert!(wire.stream);
        assert_eq!(wire.body["stream"], true);
        assert_eq!(wire.body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_streaming_multiple_choices_rejected() {
        let mut req = ChatRequest::new("gpt-public", vec![ChatMessage::user("hi")]);
        req.stream = true;
        req.n = Some(2);
        assert!(matches!(
            OpenAiAdapter.encode_request(&req, &binding()),
            Err(ProviderError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn test_decode_reports_public_model() {
        let body = br#"{"id":"chatcmpl-1","object":"chat.completion","created":1,"model":"gpt-4.1-2025-04-14",
            "choices":[{"index":0,"message":{"role":"assistant","content":"Hi there"},"finish_reason":"stop"}],
            "usage":{"prompt_tokens":9,"completion_tokens":3,"total_tokens":12}}"#;
        let decoded = OpenAiAdapter.decode_response(body, &binding()).unwrap();
        assert_eq!(decoded.response.model, "gpt-public");
        assert_eq!(decoded.response.choices[0].message.content.as_deref(), Some("Hi there"));
        assert_eq!(decoded.reported_usage, Some(TokenCounts::new(9, 3)));
    }

    #[test]
    fn test_decode_without_usage() {
        let body = br#"{"choices":[{"message":{"content":"x"}}]}"#;
        let decoded = OpenAiAdapter.decode_response(body, &binding()).unwrap();
        assert!(decoded.reported_usage.is_none());
    }

    #[test]
    fn test_decode_malformed_is_protocol_error() {
        let err = OpenAiAdapter.decode_response(b"<html>", &binding()).unwrap_err();
        assert!(matches!(err, ProviderError::Protocol { payload, .. } if payload == "<html>"));
    }

    #[test]
    fn test_stream_usage_lands_on_final_event() {
        let mut decoder = OpenAiAdapter.stream_decoder(&binding(), 4);
        let mut events = Vec::new();
        for data in [
            r#"{"id":"c1","choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#,
            r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#,
            r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"lo"}}]}"#,
            r#"{"id":"c1","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
            r#"{"id":"c1","choices":[],"usage":{"prompt_tokens":8,"completion_tokens":2,"total_tokens":10}}"#,
        ] {
            events.extend(decoder.decode_event(&SseEvent::data(data)).unwrap());
        }
        events.extend(decoder.decode_event(&SseEvent::Done).unwrap());

        assert_eq!(events.len(), 3);
        assert_eq!(decoder.response_id(), "c1");
        let StreamEvent::End(end) = &events[2] else {
            panic!("expected end");
        };
        assert_eq!(end.usage, TokenCounts::new(8, 2));
        assert_eq!(end.output_tokens, 2);
        assert_eq!(end.finish_reason, "stop");
    }

    #[test]
    fn test_stream_tool_call_fragments() {
        let mut decoder = OpenAiAdapter.stream_decoder(&binding(), 1);
        let events = decoder
            .decode_event(&SseEvent::data(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"get","arguments":""}}]}}]}"#,
            ))
            .unwrap();
        let StreamEvent::Delta(delta) = &events[0] else {
            panic!("expected delta");
        };
        let calls = delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_stream_error_chunk() {
        let mut decoder = OpenAiAdapter.stream_decoder(&binding(), 1);
        let err = decoder
            .decode_event(&SseEvent::data(r#"{"error":{"message":"overloaded"}}"#))
            .unwrap_err();
        assert!(matches!(err, ProviderError::Stream(m) if m == "overloaded"));
    }

    #[test]
    fn test_close_without_finish_is_abnormal() {
        let mut decoder = OpenAiAdapter.stream_decoder(&binding(), 1);
        decoder
            .decode_event(&SseEvent::data(r#"{"choices":[{"delta":{"content":"partial"}}]}"#))
            .unwrap();
        assert!(decoder.end_of_input().is_none());
        let (usage, rest) = decoder.partial_usage();
        assert_eq!(usage, TokenCounts::new(1, 2));
        assert_eq!(rest, 2);
    }
}
