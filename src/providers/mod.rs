//! Upstream providers.
//!
//! Normalized request/response types, one adapter per wire protocol family,
//! the model registry that binds public model ids to upstreams, and the
//! outbound HTTP transport.

pub mod adapter;
pub mod aggregator;
pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod registry;
pub mod sse;
pub mod tokens;
pub mod transport;
pub mod types;
pub mod util;

pub use self::adapter::{ProviderAdapter, ProviderFamily, StreamDecoder, StreamEvent};
pub use self::registry::{ModelRegistry, ProviderBinding};
pub use self::transport::{HttpTransport, UpstreamTransport};

// ---------------------------------------------------------------------------
// ProviderError
// ---------------------------------------------------------------------------

/// Errors raised by adapters and the upstream transport.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Connection, timeout or reset while talking to the upstream.
    #[error("transport error: {0}")]
    Transport(String),

    /// The upstream answered with a payload the adapter cannot decode.
    #[error("protocol error: {message}")]
    Protocol { message: String, payload: String },

    #[error("{0}")]
    UnsupportedFeature(String),

    /// Non-2xx status from the upstream.
    #[error("upstream error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The upstream ended a stream early or reported an in-band error.
    #[error("stream error: {0}")]
    Stream(String),
}

impl ProviderError {
    pub fn protocol(message: impl Into<String>, payload: impl AsRef<[u8]>) -> Self {
        Self::Protocol {
            message: message.into(),
            payload: String::from_utf8_lossy(payload.as_ref()).into_owned(),
        }
    }

    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::Api {
            status: 429,
            message: "slow down".into(),
        };
        assert_eq!(err.to_string(), "upstream error (429): slow down");
        let err = ProviderError::protocol("bad json", b"{oops");
        assert_eq!(err.to_string(), "protocol error: bad json");
    }

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(ProviderError::Transport("reset".into()).is_retryable());
        assert!(!ProviderError::Stream("closed".into()).is_retryable());
        assert!(
            !ProviderError::Api {
                status: 503,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(!ProviderError::protocol("x", "y").is_retryable());
    }
}
