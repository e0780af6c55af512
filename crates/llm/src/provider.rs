//! LLM Provider Trait

use async_trait::async_trait;

use crate::types::{Completion, CompletionRequest, LlmResult};

/// A chat model reachable over HTTP.
///
/// Analysis calls are single, non-streaming completions over text turns.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    /// Model requests are sent to unless overridden.
    fn model(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> LlmResult<Completion>;
}
