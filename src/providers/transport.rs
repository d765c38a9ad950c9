//! Outbound transport to upstream providers.
//!
//! The gateway talks to upstreams only through [`UpstreamTransport`], so
//! tests can substitute a scripted transport for the reqwest one.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};

use crate::config::UpstreamConfig;
use crate::providers::ProviderError;
use crate::providers::adapter::WireRequest;

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// The in-flight send returned by [`UpstreamTransport::send`].
pub type BoxedSend<'a> =
    Pin<Box<dyn Future<Output = Result<UpstreamResponse, ProviderError>> + Send + 'a>>;

/// Status line and a lazily read body.
pub struct UpstreamResponse {
    pub status: u16,
    pub body: BodyStream,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the whole body.
    pub async fn collect(self) -> Result<Vec<u8>, ProviderError> {
        let mut body = self.body;
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

pub trait UpstreamTransport: Send + Sync {
    /// Send the request and resolve once response headers arrive. Network
    /// failures, before or after the headers, are `ProviderError::Transport`.
    fn send(&self, request: WireRequest) -> BoxedSend<'_>;
}

/// reqwest-backed transport with a shared connection pool.
///
/// Buffered calls are bounded end to end by `timeout_secs`. Streams may run
/// longer; for them the same value bounds the silence between reads.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &UpstreamConfig) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .read_timeout(timeout)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(concat!("llm-gateway/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, timeout })
    }
}

impl UpstreamTransport for HttpTransport {
    fn send(&self, request: WireRequest) -> BoxedSend<'_> {
        Box::pin(async move {
            let mut builder = self.client.post(&request.url).json(&request.body);
            for (name, value) in &request.headers {
                if name.eq_ignore_ascii_case("content-type") {
                    continue;
                }
                builder = builder.header(name.as_str(), value.as_str());
            }
            if request.stream {
                builder = builder.header(reqwest::header::ACCEPT, "text/event-stream");
            } else {
                builder = builder.timeout(self.timeout);
            }

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let body = response
                .bytes_stream()
                .map_err(|e| ProviderError::Transport(e.to_string()));
            Ok(UpstreamResponse {
                status,
                body: Box::pin(body),
            })
        })
    }
}
