//! Streaming transcoder.
//!
//! Pulls raw bytes from the upstream body, frames them as SSE, runs them
//! through the adapter's [`StreamDecoder`] and yields normalized
//! [`StreamFrame`]s in upstream order. The transcoder owns the exchange's
//! accounting: it is performed exactly once, when the stream completes,
//! fails, or is dropped by a disconnecting caller.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde_json::{Value, json};

use crate::accounting::{ExchangeContext, UsageAccountant, UsageStatus};
use crate::error::AppError;
use crate::providers::ProviderError;
use crate::providers::adapter::{StreamDelta, StreamFinal};
use crate::providers::sse::{SseEvent, SseParser};
use crate::providers::transport::BodyStream;
use crate::providers::types::{ChatChunk, ChunkChoice, Delta};
use crate::providers::{StreamDecoder, StreamEvent};

/// One unit on the caller's event stream.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    /// A normalized chunk and the output tokens attributed to it.
    Chunk { chunk: ChatChunk, output_tokens: u32 },
    /// Terminal failure. Carries the error envelope and the partial usage.
    Error { body: Value, output_tokens: u32 },
    /// End-of-stream marker after a completed stream.
    Done,
}

impl StreamFrame {
    /// The SSE `data:` payload for this frame.
    pub fn data(&self) -> String {
        match self {
            Self::Chunk { chunk, .. } => serde_json::to_string(chunk).unwrap_or_default(),
            Self::Error { body, .. } => body.to_string(),
            Self::Done => "[DONE]".to_string(),
        }
    }

    /// Characters of generated text carried by this frame.
    pub fn text_chars(&self) -> usize {
        let Self::Chunk { chunk, .. } = self else {
            return 0;
        };
        chunk
            .choices
            .iter()
            .map(|choice| {
                choice.delta.content.as_deref().map_or(0, |c| c.chars().count())
                    + choice
                        .delta
                        .tool_calls
                        .iter()
                        .flatten()
                        .map(|call| call.text_len())
                        .sum::<usize>()
            })
            .sum()
    }

    pub fn output_tokens(&self) -> u32 {
        match self {
            Self::Chunk { output_tokens, .. } | Self::Error { output_tokens, .. } => *output_tokens,
            Self::Done => 0,
        }
    }
}

pub struct Transcoder {
    /// `None` once the exchange reached a terminal state; dropping it cancels
    /// the upstream read.
    body: Option<BodyStream>,
    parser: SseParser,
    decoder: Box<dyn StreamDecoder>,
    pending: VecDeque<StreamFrame>,
    model: String,
    created: i64,
    request_id: String,
    /// What the caller has actually been handed.
    yielded_chars: usize,
    yielded_tokens: u32,
    accounting: Option<(UsageAccountant, ExchangeContext)>,
}

impl std::fmt::Debug for Transcoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcoder")
            .field("request_id", &self.request_id)
            .field("model", &self.model)
            .field("finished", &self.body.is_none())
            .finish_non_exhaustive()
    }
}

impl Transcoder {
    pub fn new(
        body: BodyStream,
        decoder: Box<dyn StreamDecoder>,
        accountant: UsageAccountant,
        context: ExchangeContext,
    ) -> Self {
        Self {
            body: Some(body),
            parser: SseParser::new(),
            decoder,
            pending: VecDeque::new(),
            model: context.binding.model.clone(),
            created: chrono::Utc::now().timestamp(),
            request_id: context.request_id.clone(),
            yielded_chars: 0,
            yielded_tokens: 0,
            accounting: Some((accountant, context)),
        }
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatChunk {
        ChatChunk {
            id: self.decoder.response_id().to_string(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    fn handle_events(&mut self, events: Vec<SseEvent>) {
        for event in events {
            if self.body.is_none() {
                return;
            }
            match self.decoder.decode_event(&event) {
                Ok(decoded) => {
                    for item in decoded {
                        match item {
                            StreamEvent::Delta(delta) => self.push_delta(delta),
                            StreamEvent::End(last) => {
                                self.complete(last);
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
    }

    fn push_delta(&mut self, delta: StreamDelta) {
        if delta.is_noop() {
            return;
        }
        let output_tokens = delta.output_tokens;
        let chunk = self.chunk(
            Delta {
                role: delta.role,
                content: delta.content,
                tool_calls: delta.tool_calls,
            },
            None,
        );
        self.pending.push_back(StreamFrame::Chunk {
            chunk,
            output_tokens,
        });
    }

    fn complete(&mut self, last: StreamFinal) {
        self.body = None;
        let mut chunk = self.chunk(Delta::default(), Some(last.finish_reason.clone()));
        chunk.usage = Some(last.usage.to_usage());
        self.pending.push_back(StreamFrame::Chunk {
            chunk,
            output_tokens: last.output_tokens,
        });
        self.pending.push_back(StreamFrame::Done);

        tracing::info!(
            request_id = %self.request_id,
            input_tokens = last.usage.input,
            output_tokens = last.usage.output,
            finish_reason = %last.finish_reason,
            "Stream completed"
        );
        if let Some((accountant, context)) = self.accounting.take() {
            accountant.account(
                &context,
                last.usage,
                Some(&last.finish_reason),
                UsageStatus::Completed,
            );
        }
    }

    fn fail(&mut self, error: ProviderError) {
        self.body = None;
        let (usage, output_tokens) = self.decoder.partial_usage();
        tracing::warn!(
            request_id = %self.request_id,
            error = %error,
            output_tokens = usage.output,
            "Upstream stream failed"
        );
        if let Some((accountant, context)) = self.accounting.take() {
            accountant.account(&context, usage, None, UsageStatus::Partial);
        }

        let app_error = AppError::from(error);
        let mut body = json!(app_error.to_body());
        body["usage"] = json!(usage.to_usage());
        self.pending.push_back(StreamFrame::Error {
            body,
            output_tokens,
        });
    }

    fn end_of_input(&mut self) {
        if let Some(event) = self.parser.finish() {
            self.handle_events(vec![event]);
        }
        if self.body.is_none() {
            return;
        }
        match self.decoder.end_of_input() {
            Some(last) => self.complete(last),
            None => self.fail(ProviderError::Stream(
                "upstream closed the stream before completion".to_string(),
            )),
        }
    }
}

impl Stream for Transcoder {
    type Item = StreamFrame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(frame) = this.pending.pop_front() {
                this.yielded_chars += frame.text_chars();
                this.yielded_tokens = this.yielded_tokens.saturating_add(frame.output_tokens());
                return Poll::Ready(Some(frame));
            }
            let Some(body) = this.body.as_mut() else {
                return Poll::Ready(None);
            };
            match body.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(bytes))) => {
                    let events = this.parser.feed(&bytes);
                    this.handle_events(events);
                }
                Poll::Ready(Some(Err(e))) => this.fail(e),
                Poll::Ready(None) => this.end_of_input(),
            }
        }
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        if let Some((accountant, context)) = self.accounting.take() {
            // Bill what was yielded; decoded frames still queued never
            // reached the caller.
            let (mut usage, _) = self.decoder.partial_usage();
            let estimate = u32::try_from(self.yielded_chars.div_ceil(4)).unwrap_or(u32::MAX);
            usage.output = self.yielded_tokens.max(estimate);
            tracing::info!(
                request_id = %self.request_id,
                output_tokens = usage.output,
                undelivered = self.pending.len(),
                "Caller disconnected mid-stream"
            );
            accountant.account(&context, usage, None, UsageStatus::Partial);
        }
    }
}
