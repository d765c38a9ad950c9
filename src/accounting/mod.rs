//! Usage accounting.
//!
//! The response path builds one [`UsageRecord`] per upstream exchange and
//! hands it to a background worker over a channel; persistence latency and
//! failures never reach the caller.

pub mod store;
pub mod worker;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::auth::CallerIdentity;
use crate::providers::ProviderBinding;
use crate::providers::types::TokenCounts;

pub use self::store::{UsageStore, UserUsageSummary};
pub use self::worker::spawn_usage_worker;

/// Whether the caller received the whole response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Completed,
    Partial,
}

impl UsageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Partial => "partial",
        }
    }
}

/// The persisted accounting row for one exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    /// Server-assigned and unique per exchange; the store deduplicates on it.
    pub exchange_id: String,
    /// Caller-visible correlation id. Callers may reuse it.
    pub request_id: String,
    pub user_id: String,
    pub api_key_id: String,
    pub model: String,
    pub provider: String,
    pub upstream_model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_in: f64,
    pub cost_out: f64,
    pub messages_cnt: u32,
    pub finish_reason: Option<String>,
    pub status: UsageStatus,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Who asked, what served it, and when it started. Captured once the model
/// is routed and carried to wherever the exchange ends.
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    pub exchange_id: String,
    pub request_id: String,
    pub identity: CallerIdentity,
    pub binding: Arc<ProviderBinding>,
    pub messages_cnt: u32,
    pub started: Instant,
}

impl ExchangeContext {
    /// The record for this exchange with the given final counts.
    pub fn record(
        &self,
        usage: TokenCounts,
        finish_reason: Option<&str>,
        status: UsageStatus,
    ) -> UsageRecord {
        let (cost_in, cost_out) = self.binding.pricing.cost(usage.input, usage.output);
        UsageRecord {
            exchange_id: self.exchange_id.clone(),
            request_id: self.request_id.clone(),
            user_id: self.identity.user_id.clone(),
            api_key_id: self.identity.api_key_id.clone(),
            model: self.binding.model.clone(),
            provider: self.binding.provider.clone(),
            upstream_model: self.binding.upstream_model.clone(),
            input_tokens: usage.input,
            output_tokens: usage.output,
            cost_in,
            cost_out,
            messages_cnt: self.messages_cnt,
            finish_reason: finish_reason.map(str::to_string),
            status,
            latency_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            created_at: Utc::now(),
        }
    }
}

/// Enqueues usage records for the background worker.
#[derive(Debug, Clone)]
pub struct UsageAccountant {
    tx: mpsc::UnboundedSender<UsageRecord>,
}

impl UsageAccountant {
    pub fn new(tx: mpsc::UnboundedSender<UsageRecord>) -> Self {
        Self { tx }
    }

    /// An accountant and the receiver its records arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UsageRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Price and enqueue one exchange. Never blocks.
    pub fn account(
        &self,
        context: &ExchangeContext,
        usage: TokenCounts,
        finish_reason: Option<&str>,
        status: UsageStatus,
    ) {
        let record = context.record(usage, finish_reason, status);
        tracing::debug!(
            request_id = %record.request_id,
            model = %record.model,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            status = record.status.as_str(),
            "Usage recorded"
        );
        if let Err(e) = self.tx.send(record) {
            tracing::error!(
                request_id = %e.0.request_id,
                "Usage worker is gone; dropping usage record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Scope;
    use crate::providers::ProviderFamily;
    use crate::providers::registry::PricingEntry;

    fn context() -> ExchangeContext {
        let mut binding =
            ProviderBinding::new("claude-sonnet", ProviderFamily::Anthropic, "https://x");
        binding.upstream_model = "claude-sonnet-4".into();
        binding.pricing = PricingEntry {
            input_per_million: 3.0,
            output_per_million: 15.0,
        };
        ExchangeContext {
            exchange_id: "ex-1".into(),
            request_id: "req-1".into(),
            identity: CallerIdentity {
                user_id: "u1".into(),
                user_name: "alice".into(),
                api_key_id: "k1".into(),
                scope: Scope::unrestricted(),
            },
            binding: Arc::new(binding),
            messages_cnt: 2,
            started: Instant::now(),
        }
    }

    #[test]
    fn test_record_prices_tokens() {
        let record = context().record(
            TokenCounts::new(2_000, 1_000),
            Some("stop"),
            UsageStatus::Completed,
        );
        assert!((record.cost_in - 0.006).abs() < 1e-12);
        assert!((record.cost_out - 0.015).abs() < 1e-12);
        assert_eq!(record.upstream_model, "claude-sonnet-4");
        assert_eq!(record.provider, "anthropic");
        assert_eq!(record.messages_cnt, 2);
        assert_eq!(record.finish_reason.as_deref(), Some("stop"));
        assert_eq!(record.exchange_id, "ex-1");
        assert_eq!(record.request_id, "req-1");
    }

    #[test]
    fn test_account_enqueues_once() {
        let (accountant, mut rx) = UsageAccountant::channel();
        accountant.account(&context(), TokenCounts::new(1, 2), None, UsageStatus::Partial);
        let record = rx.try_recv().unwrap();
        assert_eq!(record.status, UsageStatus::Partial);
        assert_eq!(record.output_tokens, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_account_after_worker_exit_does_not_panic() {
        let (accountant, rx) = UsageAccountant::channel();
        drop(rx);
        accountant.account(&context(), TokenCounts::default(), None, UsageStatus::Completed);
    }
}
