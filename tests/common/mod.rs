#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use llm_gateway::AppState;
use llm_gateway::accounting::{UsageAccountant, UsageRecord};
use llm_gateway::auth::users;
use llm_gateway::config::Config;
use llm_gateway::db::Database;
use llm_gateway::providers::adapter::WireRequest;
use llm_gateway::providers::registry::{PricingEntry, RegistryTable};
use llm_gateway::providers::transport::{BoxedSend, UpstreamResponse};
use llm_gateway::providers::{
    ModelRegistry, ProviderBinding, ProviderError, ProviderFamily, UpstreamTransport,
};

type Scripted = Result<(u16, Vec<Result<Bytes, ProviderError>>), ProviderError>;

/// Upstream stand-in: replays queued responses in order, counts calls and
/// keeps every request it was handed.
#[derive(Default)]
pub struct ScriptedUpstream {
    script: Mutex<VecDeque<Scripted>>,
    sent: Mutex<Vec<WireRequest>>,
    calls: AtomicUsize,
}

impl ScriptedUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply_json(&self, status: u16, body: serde_json::Value) {
        self.push(Ok((status, vec![Ok(Bytes::from(body.to_string()))])));
    }

    pub fn reply_chunks<S: AsRef<str>>(&self, status: u16, chunks: &[S]) {
        let chunks = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.as_ref().to_string())))
            .collect();
        self.push(Ok((status, chunks)));
    }

    /// Chunks followed by a mid-body failure.
    pub fn reply_broken<S: AsRef<str>>(&self, chunks: &[S], error: ProviderError) {
        let mut body: Vec<_> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.as_ref().to_string())))
            .collect();
        body.push(Err(error));
        self.push(Ok((200, body)));
    }

    pub fn fail(&self, error: ProviderError) {
        self.push(Err(error));
    }

    fn push(&self, item: Scripted) {
        self.script.lock().unwrap().push_back(item);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<WireRequest> {
        self.sent.lock().unwrap().clone()
    }
}

impl UpstreamTransport for ScriptedUpstream {
    fn send(&self, request: WireRequest) -> BoxedSend<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(request);
        let next = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            let (status, chunks) =
                next.unwrap_or_else(|| Err(ProviderError::Transport("nothing scripted".into())))?;
            Ok(UpstreamResponse {
                status,
                body: Box::pin(futures::stream::iter(chunks)),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn binding(model: &str, family: ProviderFamily, base_url: &str) -> ProviderBinding {
    let mut binding = ProviderBinding::new(model, family, base_url);
    binding.pricing = PricingEntry {
        input_per_million: 2.0,
        output_per_million: 8.0,
    };
    if family == ProviderFamily::Anthropic {
        binding.max_output_tokens = Some(1024);
    }
    binding
}

pub fn registry(bindings: Vec<ProviderBinding>) -> Arc<ModelRegistry> {
    let table = RegistryTable::build(bindings.into_iter().map(|b| (b, Vec::new())).collect());
    Arc::new(ModelRegistry::new(table))
}

/// Full application state over an in-memory database. Retry backoff is
/// shortened so retry tests stay fast.
pub fn state(
    bindings: Vec<ProviderBinding>,
    transport: Arc<dyn UpstreamTransport>,
) -> (AppState, mpsc::UnboundedReceiver<UsageRecord>) {
    let db = Database::open_in_memory().unwrap();
    let (accountant, usage) = UsageAccountant::channel();
    let mut config = Config::default();
    config.upstream.retry_backoff_ms = 1;
    config.upstream.max_backoff_ms = 2;
    let state = AppState::new(
        config,
        PathBuf::from("llm-gateway.toml"),
        db,
        registry(bindings),
        transport,
        accountant,
    );
    (state, usage)
}

/// Create a user with one key of the given scope. Returns (user id, key).
pub fn issue_key(state: &AppState, name: &str, scope: &str) -> (String, String) {
    let user = users::create_user(&state.db, name).unwrap();
    let key = users::create_api_key(&state.db, &user.id, "test", scope).unwrap();
    (user.id, key.plaintext)
}

/// Every record currently queued.
pub fn drain(usage: &mut mpsc::UnboundedReceiver<UsageRecord>) -> Vec<UsageRecord> {
    let mut out = Vec::new();
    while let Ok(record) = usage.try_recv() {
        out.push(record);
    }
    out
}

// ---------------------------------------------------------------------------
// Upstream payloads
// ---------------------------------------------------------------------------

pub fn openai_completion(content: &str, prompt: u32, completion: u32) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-up",
        "object": "chat.completion",
        "created": 1,
        "model": "upstream",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion
        }
    })
}

/// One OpenAI-style SSE content event.
pub fn openai_delta(text: &str) -> String {
    let chunk = serde_json::json!({
        "id": "chatcmpl-up",
        "choices": [{"index": 0, "delta": {"content": text}}]
    });
    format!("data: {chunk}\n\n")
}

/// The closing OpenAI events: finish reason, optional usage, `[DONE]`.
pub fn openai_finish(usage: Option<(u32, u32)>) -> String {
    let mut chunk = serde_json::json!({
        "id": "chatcmpl-up",
        "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]
    });
    if let Some((prompt, completion)) = usage {
        chunk["usage"] = serde_json::json!({
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion
        });
    }
    format!("data: {chunk}\n\ndata: [DONE]\n\n")
}
