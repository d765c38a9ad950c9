//! The adapter contract shared by every upstream family.
//!
//! An adapter encodes a normalized [`ChatRequest`] into the upstream's wire
//! request, decodes a buffered upstream body back into a [`ChatResponse`],
//! and hands out a fresh [`StreamDecoder`] per streaming exchange.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::providers::registry::ProviderBinding;
use crate::providers::sse::SseEvent;
use crate::providers::tokens::estimate_tokens;
use crate::providers::types::{ChatRequest, ChatResponse, TokenCounts, ToolCallDelta};
use crate::providers::{ProviderError, aggregator, anthropic, gemini, openai};

// MARK: - Family

/// Closed set of supported wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    OpenAi,
    Anthropic,
    Gemini,
    Aggregator,
}

impl ProviderFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Aggregator => "aggregator",
        }
    }

    pub fn adapter(self) -> &'static dyn ProviderAdapter {
        match self {
            Self::OpenAi => &openai::OpenAiAdapter,
            Self::Anthropic => &anthropic::AnthropicAdapter,
            Self::Gemini => &gemini::GeminiAdapter,
            Self::Aggregator => &aggregator::AggregatorAdapter,
        }
    }
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// MARK: - Wire types

/// A fully encoded upstream request.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub stream: bool,
}

impl WireRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A decoded buffered response plus the usage the upstream reported, if any.
#[derive(Debug, Clone)]
pub struct DecodedResponse {
    pub response: ChatResponse,
    pub reported_usage: Option<TokenCounts>,
}

// MARK: - Adapter trait

pub trait ProviderAdapter: Send + Sync {
    fn family(&self) -> ProviderFamily;

    /// Build the upstream request. Fails with `UnsupportedFeature` before any
    /// network activity when the request cannot be expressed upstream.
    fn encode_request(
        &self,
        request: &ChatRequest,
        binding: &ProviderBinding,
    ) -> Result<WireRequest, ProviderError>;

    /// Parse a buffered 2xx body. The response reports `binding.model`.
    fn decode_response(
        &self,
        body: &[u8],
        binding: &ProviderBinding,
    ) -> Result<DecodedResponse, ProviderError>;

    /// A decoder for one streaming exchange.
    fn stream_decoder(&self, binding: &ProviderBinding, prompt_estimate: u32)
    -> Box<dyn StreamDecoder>;

    /// Human-readable message from an upstream error body.
    fn error_message(&self, body: &[u8]) -> String {
        extract_error_message(body)
    }
}

/// `{"error": {"message": ..}}`, `{"error": ".."}` or the raw body.
pub fn extract_error_message(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return text.trim().to_string();
    };
    let error = value.get("error").unwrap_or(&value);
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| text.trim().to_string())
}

// MARK: - Stream events

/// One incremental piece of a normalized stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamDelta {
    pub role: Option<String>,
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCallDelta>>,
    /// Output tokens attributed to this event.
    pub output_tokens: u32,
}

impl StreamDelta {
    /// Nothing for the caller and nothing to count.
    pub fn is_noop(&self) -> bool {
        self.role.is_none()
            && self.content.as_deref().is_none_or(str::is_empty)
            && self.tool_calls.as_ref().is_none_or(Vec::is_empty)
            && self.output_tokens == 0
    }
}

/// The terminal event of a completed stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFinal {
    pub finish_reason: String,
    /// Cumulative usage for the whole exchange.
    pub usage: TokenCounts,
    /// Output tokens not yet attributed to an earlier delta.
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Delta(StreamDelta),
    End(StreamFinal),
}

/// Per-exchange stream state. Everything the decoder accumulates lives here,
/// so concurrent streams never share it.
pub trait StreamDecoder: Send {
    /// Decode one framed upstream event.
    fn decode_event(&mut self, event: &SseEvent) -> Result<Vec<StreamEvent>, ProviderError>;

    /// The upstream input ended. Returns the final event when the upstream
    /// had already signalled completion, `None` for an abnormal close.
    fn end_of_input(&mut self) -> Option<StreamFinal>;

    /// Counts for an exchange that ended without a final event, plus the
    /// output tokens not yet attributed to any delta.
    fn partial_usage(&mut self) -> (TokenCounts, u32);

    fn response_id(&self) -> &str;
}

// MARK: - Token tally

/// Tracks reported and delivered tokens for one stream.
///
/// Every output token is attributed to exactly one event: content deltas
/// carry the growth of the upstream's cumulative count, and the final (or
/// error) event carries whatever is left. The attributed sum therefore
/// always equals the count handed to accounting.
#[derive(Debug, Default)]
pub struct UsageTally {
    prompt_estimate: u32,
    reported_input: Option<u32>,
    reported_output: Option<u32>,
    delivered_chars: usize,
    attributed: u32,
}

impl UsageTally {
    pub fn new(prompt_estimate: u32) -> Self {
        Self {
            prompt_estimate,
            ..Self::default()
        }
    }

    /// Record cumulative counts from the upstream. Counts never go down.
    pub fn report(&mut self, input: Option<u32>, output: Option<u32>) {
        if let Some(input) = input {
            self.reported_input = Some(self.reported_input.map_or(input, |v| v.max(input)));
        }
        if let Some(output) = output {
            self.reported_output = Some(self.reported_output.map_or(output, |v| v.max(output)));
        }
    }

    /// Note text delivered to the caller.
    pub fn deliver(&mut self, text: &str) {
        self.deliver_chars(text.chars().count());
    }

    pub fn deliver_chars(&mut self, chars: usize) {
        self.delivered_chars += chars;
    }

    /// Output tokens reported since the last attribution.
    pub fn attribute(&mut self) -> u32 {
        let target = self.reported_output.unwrap_or(0);
        self.take_up_to(target)
    }

    /// Close out a completed stream.
    pub fn finalize(&mut self) -> (TokenCounts, u32) {
        let target = self
            .reported_output
            .unwrap_or_else(|| self.delivered_estimate());
        let delta = self.take_up_to(target);
        (TokenCounts::new(self.input(), self.attributed), delta)
    }

    /// Close out an aborted stream: only what reached the caller.
    pub fn finalize_partial(&mut self) -> (TokenCounts, u32) {
        let target = self.delivered_estimate().max(self.attributed);
        let delta = self.take_up_to(target);
        (TokenCounts::new(self.input(), self.attributed), delta)
    }

    fn input(&self) -> u32 {
        self.reported_input.unwrap_or(self.prompt_estimate)
    }

    fn delivered_estimate(&self) -> u32 {
        let chars = self.delivered_chars.div_ceil(4);
        u32::try_from(chars).unwrap_or(u32::MAX)
    }

    fn take_up_to(&mut self, target: u32) -> u32 {
        let delta = target.saturating_sub(self.attributed);
        self.attributed += delta;
        delta
    }
}

/// Bookkeeping shared by the concrete stream decoders.
#[derive(Debug)]
pub struct DecoderState {
    pub id: String,
    pub tally: UsageTally,
    pub finish_reason: Option<String>,
    role_sent: bool,
    ended: bool,
}

impl DecoderState {
    pub fn new(id: String, prompt_estimate: u32) -> Self {
        Self {
            id,
            tally: UsageTally::new(prompt_estimate),
            finish_reason: None,
            role_sent: false,
            ended: false,
        }
    }

    /// A delta carrying text and/or tool calls, with the assistant role on
    /// the first one.
    pub fn delta(
        &mut self,
        content: Option<String>,
        tool_calls: Option<Vec<ToolCallDelta>>,
    ) -> StreamEvent {
        if let Some(text) = &content {
            self.tally.deliver(text);
        }
        if let Some(calls) = &tool_calls {
            for call in calls {
                self.tally.deliver_chars(call.text_len());
            }
        }
        let role = (!self.role_sent).then(|| {
            self.role_sent = true;
            "assistant".to_string()
        });
        StreamEvent::Delta(StreamDelta {
            role,
            content,
            tool_calls,
            output_tokens: self.tally.attribute(),
        })
    }

    /// The final event, produced at most once.
    pub fn end(&mut self) -> Option<StreamFinal> {
        if self.ended {
            return None;
        }
        self.ended = true;
        let (usage, output_tokens) = self.tally.finalize();
        Some(StreamFinal {
            finish_reason: self.finish_reason.clone().unwrap_or_else(|| "stop".to_string()),
            usage,
            output_tokens,
        })
    }

    /// The final event if the upstream already sent its stop reason.
    pub fn end_if_finished(&mut self) -> Option<StreamFinal> {
        if self.finish_reason.is_some() {
            self.end()
        } else {
            None
        }
    }

    pub fn partial(&mut self) -> (TokenCounts, u32) {
        self.ended = true;
        self.tally.finalize_partial()
    }
}

/// Estimated output for a buffered response body the upstream did not count.
pub fn estimate_completion(response: &ChatResponse) -> u32 {
    response
        .choices
        .iter()
        .map(|c| {
            let text = c.message.content.as_deref().map_or(0, estimate_tokens);
            let calls = c.message.tool_calls.as_ref().map_or(0, |calls| {
                calls
                    .iter()
                    .map(|t| estimate_tokens(&t.function.name) + estimate_tokens(&t.function.arguments))
                    .sum()
            });
            text + calls
        })
        .sum()
}
