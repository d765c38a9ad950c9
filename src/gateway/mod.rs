//! Gateway orchestrator.
//!
//! Drives one chat completion through
//! `authorize -> route -> shape -> encode -> upstream -> decode/transcode -> account`.
//! Every rejection before the upstream call leaves no usage record and makes
//! no outbound request.

pub mod retry;
pub mod stream;

use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;

use crate::accounting::{ExchangeContext, UsageAccountant, UsageStatus};
use crate::auth::{CallerIdentity, Operation};
use crate::error::AppError;
use crate::providers::adapter::{ProviderAdapter, WireRequest, estimate_completion};
use crate::providers::tokens::{estimate_prompt, trim_history};
use crate::providers::transport::UpstreamResponse;
use crate::providers::types::{ChatRequest, ChatResponse, TokenCounts};
use crate::providers::{ModelRegistry, ProviderBinding, ProviderError, UpstreamTransport};

pub use self::retry::RetryPolicy;
pub use self::stream::{StreamFrame, Transcoder};

/// What the caller gets back.
#[derive(Debug)]
pub enum GatewayResponse {
    Json(ChatResponse),
    Stream(Transcoder),
}

pub struct Gateway {
    registry: Arc<ModelRegistry>,
    transport: Arc<dyn UpstreamTransport>,
    accountant: UsageAccountant,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    pub fn new(
        registry: Arc<ModelRegistry>,
        transport: Arc<dyn UpstreamTransport>,
        accountant: UsageAccountant,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            transport,
            accountant,
            retry,
        }
    }

    /// Serve one chat completion for an authenticated caller.
    pub async fn complete(
        &self,
        identity: &CallerIdentity,
        request: ChatRequest,
        request_id: &str,
    ) -> Result<GatewayResponse, AppError> {
        let span = tracing::info_span!(
            "chat_completion",
            request_id = %request_id,
            model = %request.model,
            user_id = %identity.user_id,
            stream = request.stream,
        );
        self.complete_inner(identity, request, request_id)
            .instrument(span)
            .await
    }

    async fn complete_inner(
        &self,
        identity: &CallerIdentity,
        mut request: ChatRequest,
        request_id: &str,
    ) -> Result<GatewayResponse, AppError> {
        let started = Instant::now();

        identity.authorize(Operation::ChatCompletion {
            model: &request.model,
        })?;
        if request.messages.is_empty() {
            return Err(AppError::BadRequest("'messages' must not be empty".to_string()));
        }

        let binding = self.registry.resolve(&request.model)?;
        shape_request(&mut request, &binding);

        let adapter = binding.family.adapter();
        let wire = adapter.encode_request(&request, &binding)?;
        tracing::debug!(
            provider = %binding.provider,
            upstream_model = %binding.upstream_model,
            url = %wire.url,
            "Routed request"
        );

        let context = ExchangeContext {
            exchange_id: uuid::Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            identity: identity.clone(),
            binding: Arc::clone(&binding),
            messages_cnt: u32::try_from(request.messages.len()).unwrap_or(u32::MAX),
            started,
        };
        let prompt_estimate = estimate_prompt(&request.messages);

        if request.stream {
            self.open_stream(adapter, wire, context, prompt_estimate).await
        } else {
            self.buffered(adapter, wire, context, prompt_estimate).await
        }
    }

    /// Streaming calls are never retried.
    async fn open_stream(
        &self,
        adapter: &'static dyn ProviderAdapter,
        wire: WireRequest,
        context: ExchangeContext,
        prompt_estimate: u32,
    ) -> Result<GatewayResponse, AppError> {
        let response = self.transport.send(wire).await?;
        let response = check_status(adapter, response).await?;
        let decoder = adapter.stream_decoder(&context.binding, prompt_estimate);
        Ok(GatewayResponse::Stream(Transcoder::new(
            response.body,
            decoder,
            self.accountant.clone(),
            context,
        )))
    }

    /// The exchange runs in its own task so a disconnecting caller cannot
    /// cancel it; the result is accounted either way.
    async fn buffered(
        &self,
        adapter: &'static dyn ProviderAdapter,
        wire: WireRequest,
        context: ExchangeContext,
        prompt_estimate: u32,
    ) -> Result<GatewayResponse, AppError> {
        let transport = Arc::clone(&self.transport);
        let accountant = self.accountant.clone();
        let retry = self.retry.clone();

        let exchange = async move {
            let body = retry::execute_with_retry(&retry, || {
                read_body(transport.as_ref(), adapter, wire.clone())
            })
            .await?;
            let decoded = adapter.decode_response(&body, &context.binding)?;

            let usage = decoded.reported_usage.unwrap_or_else(|| {
                TokenCounts::new(prompt_estimate, estimate_completion(&decoded.response))
            });
            let mut response = decoded.response;
            response.usage = usage.to_usage();
            let finish_reason = response
                .choices
                .first()
                .and_then(|c| c.finish_reason.clone());

            tracing::info!(
                input_tokens = usage.input,
                output_tokens = usage.output,
                latency_ms = u64::try_from(context.started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Completion finished"
            );
            accountant.account(&context, usage, finish_reason.as_deref(), UsageStatus::Completed);
            Ok::<_, AppError>(response)
        }
        .in_current_span();

        let response = tokio::spawn(exchange)
            .await
            .map_err(|e| AppError::Internal(format!("upstream task failed: {e}")))??;
        Ok(GatewayResponse::Json(response))
    }
}

/// One buffered attempt: send, check the status, read the whole body. A
/// body cut short is a network failure and as retryable as a failed connect.
async fn read_body(
    transport: &dyn UpstreamTransport,
    adapter: &dyn ProviderAdapter,
    wire: WireRequest,
) -> Result<Vec<u8>, ProviderError> {
    let response = transport.send(wire).await?;
    let response = check_status(adapter, response).await?;
    response.collect().await.map_err(|e| match e {
        ProviderError::Stream(message) => ProviderError::Transport(message),
        other => other,
    })
}

/// Non-2xx responses become `ProviderError::Api` with the upstream's message.
async fn check_status(
    adapter: &dyn ProviderAdapter,
    response: UpstreamResponse,
) -> Result<UpstreamResponse, ProviderError> {
    if response.is_success() {
        return Ok(response);
    }
    let status = response.status;
    let body = response.collect().await.unwrap_or_default();
    let message = adapter.error_message(&body);
    tracing::warn!(status, message = %message, "Upstream returned an error status");
    Err(ProviderError::Api { status, message })
}

/// Clamp output limits and fit history into the context window.
fn shape_request(request: &mut ChatRequest, binding: &ProviderBinding) {
    if let Some(limit) = binding.max_output_tokens {
        for field in [&mut request.max_tokens, &mut request.max_completion_tokens] {
            if let Some(requested) = field.as_mut() {
                *requested = (*requested).min(limit);
            }
        }
    }

    if binding.trim_history {
        if let Some(window) = binding.context_window {
            let reserve = request
                .requested_max_tokens()
                .or(binding.max_output_tokens)
                .unwrap_or(0);
            let budget = window.saturating_sub(reserve);
            let trimmed = trim_history(&request.messages, budget);
            if trimmed.len() < request.messages.len() {
                tracing::debug!(
                    dropped = request.messages.len() - trimmed.len(),
                    budget,
                    "Trimmed history to fit the context window"
                );
                request.messages = trimmed;
            }
        }
    }
}
