//! Aggregator upstreams (OpenRouter style): the OpenAI wire protocol plus
//! attribution headers. Keep-alive comments in their streams are dropped by
//! the SSE parser.

use crate::providers::adapter::{
    DecodedResponse, ProviderAdapter, ProviderFamily, StreamDecoder, WireRequest,
};
use crate::providers::openai::{ChatStreamDecoder, decode_chat_response, encode_chat_request};
use crate::providers::registry::ProviderBinding;
use crate::providers::types::ChatRequest;
use crate::providers::util::reject_if;
use crate::providers::ProviderError;

pub struct AggregatorAdapter;

impl ProviderAdapter for AggregatorAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Aggregator
    }

    fn encode_request(
        &self,
        request: &ChatRequest,
        binding: &ProviderBinding,
    ) -> Result<WireRequest, ProviderError> {
        reject_if(request.logit_bias.is_some(), "logit_bias", "aggregator")?;

        let mut wire = encode_chat_request(request, binding)?;
        if let Some(url) = &binding.app_url {
            wire.headers.push(("HTTP-Referer".to_string(), url.clone()));
        }
        if let Some(name) = &binding.app_name {
            wire.headers.push(("X-Title".to_string(), name.clone()));
        }
        Ok(wire)
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
