//! Deep Query LLM
//!
//! Completion providers for the analysis model calls:
//! - Anthropic Messages API
//! - OpenAI and chat-completions compatible endpoints

pub mod anthropic;
pub mod http_client;
pub mod openai;
pub mod provider;
pub mod types;

use std::sync::Arc;

pub use anthropic::AnthropicProvider;
pub use http_client::build_http_client;
pub use openai::OpenAIProvider;
pub use provider::LlmProvider;
pub use types::*;

/// Construct the provider selected by `config.provider`.
pub fn create_provider(config: ProviderConfig) -> LlmResult<Arc<dyn LlmProvider>> {
    tracing::debug!(provider = %config.provider, model = %config.model, "creating LLM provider");
    Ok(match config.provider {
        ProviderType::Anthropic => Arc::new(AnthropicProvider::new(config)?),
        ProviderType::OpenAI => Arc::new(OpenAIProvider::new(config)?),
    })
}
