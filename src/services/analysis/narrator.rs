//! Post-execution narration
//!
//! Rewrites a step's insight and the run's final summary from the results
//! that actually came back. Both calls are best-effort: any failure other
//! than cancellation leaves the model's own text in place.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use deep_query_core::StepRecord;
use deep_query_llm::{CompletionRequest, LlmProvider};

use crate::models::settings::DatasetProfile;
use crate::utils::error::{AppError, AppResult};

use super::prompts::{build_insight_prompt, build_summary_prompt, StepPrompt};

const INSIGHT_MAX_TOKENS: u32 = 256;
const SUMMARY_MAX_TOKENS: u32 = 512;

/// Writes result-grounded insights and summaries.
pub struct Narrator {
    provider: Arc<dyn LlmProvider>,
}

impl Narrator {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    /// Insight for one executed step, or `None` when the call fails.
    pub async fn step_insight(
        &self,
        question: &str,
        title: &str,
        sql: &str,
        result_summary: &str,
        dataset: &DatasetProfile,
        cancel: &CancellationToken,
    ) -> AppResult<Option<String>> {
        let prompt = build_insight_prompt(question, title, sql, result_summary, dataset);
        self.narrate("insight", prompt, INSIGHT_MAX_TOKENS, cancel).await
    }

    /// Final summary over the executed steps, or `None` when there is
    /// nothing to summarize or the call fails.
    pub async fn final_summary(
        &self,
        question: &str,
        steps: &[StepRecord],
        dataset: &DatasetProfile,
        cancel: &CancellationToken,
    ) -> AppResult<Option<String>> {
        if steps.is_empty() {
            return Ok(None);
        }
        let prompt = build_summary_prompt(question, steps, dataset);
        self.narrate("summary", prompt, SUMMARY_MAX_TOKENS, cancel).await
    }

    async fn narrate(
        &self,
        kind: &'static str,
        prompt: StepPrompt,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> AppResult<Option<String>> {
        let started = Instant::now();
        let request = CompletionRequest::new(prompt.messages)
            .with_system(prompt.system)
            .deterministic()
            .with_max_tokens(max_tokens);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            res = self.provider.complete(request) => res,
        };

        match response {
            Ok(completion) => {
                tracing::debug!(
                    kind,
                    model = %completion.model,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "narration finished"
                );
                Ok(completion.into_text().map(|text| text.trim().to_string()))
            }
            Err(e) => {
                tracing::warn!(kind, error = %e, "narration failed, keeping draft text");
                Ok(None)
            }
        }
    }
}
