//! Single-shot Query Service
//!
//! Answers a question with one generated query: cache lookup, one model
//! call for bare SQL, the safety gate, remote execution and chart inference.
//! A caller that saw the query fail may retry with `failedSql`/`sqlError`;
//! retries bypass the cache in both directions.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use deep_query_core::{infer_chart_type, strip_code_fences, validate_sql, ChartType};
use deep_query_llm::{CompletionRequest, LlmProvider};
use deep_query_remote::QueryExecutor;

use crate::models::settings::AppConfig;
use crate::services::analysis::prompts::build_single_shot_prompt;
use crate::services::query_cache::{cache_key, CacheEntry, QueryCache};
use crate::utils::error::{AppError, AppResult};

/// Body of `POST /api/query`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub years: Option<Vec<i32>>,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub failed_sql: Option<String>,
    #[serde(default)]
    pub sql_error: Option<String>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Default::default()
        }
    }

    fn is_retry(&self) -> bool {
        self.failed_sql.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub sql: String,
    pub chart_type: ChartType,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub cached: bool,
}

impl QueryResponse {
    fn from_entry(entry: CacheEntry, cached: bool) -> Self {
        Self {
            sql: entry.sql,
            chart_type: entry.chart_type,
            columns: entry.columns,
            rows: entry.rows,
            cached,
        }
    }
}

pub struct QueryService {
    provider: Arc<dyn LlmProvider>,
    queries: Arc<dyn QueryExecutor>,
    config: Arc<AppConfig>,
    cache: QueryCache,
}

impl QueryService {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        queries: Arc<dyn QueryExecutor>,
        config: Arc<AppConfig>,
    ) -> Self {
        let cache = QueryCache::from_settings(&config.cache);
        Self {
            provider,
            queries,
            config,
            cache,
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub async fn ask(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> AppResult<QueryResponse> {
        let started = Instant::now();
        let limits = &self.config.analysis;
        if request.question.chars().count() > limits.max_question_chars {
            return Err(AppError::validation(format!(
                "Question must be under {} characters.",
                limits.max_question_chars
            )));
        }
        if request.question.trim().is_empty() {
            return Err(AppError::validation("Question cannot be empty."));
        }
        let dataset = self.config.dataset(request.dataset.as_deref()).ok_or_else(|| {
            AppError::validation(format!(
                "Unknown dataset: {}",
                request.dataset.as_deref().unwrap_or("<default>")
            ))
        })?;
        let years = self.config.filter_years(request.years.as_deref());
        let key = cache_key(&request.question, years.as_deref(), Some(&dataset.key));

        let retry = request.is_retry();
        if !retry {
            if let Some(entry) = self.cache.get(&key) {
                tracing::info!(dataset = %dataset.key, "single-shot cache hit");
                return Ok(QueryResponse::from_entry(entry, true));
            }
        }

        let failed = request.failed_sql.as_deref().unwrap_or_default();
        let error = request.sql_error.as_deref().unwrap_or("Unknown error");
        let prompt = build_single_shot_prompt(
            request.question.trim(),
            dataset,
            years.as_deref(),
            retry.then_some((failed, error)),
        );

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            res = self.provider.complete(
                CompletionRequest::new(prompt.messages)
                    .with_system(prompt.system)
                    .deterministic()
            ) => res?,
        };
        let text = response
            .into_text()
            .ok_or_else(|| AppError::model_response("No SQL generated."))?;
        let sql = strip_code_fences(&text).to_string();
        validate_sql(&sql)?;

        let rows = self
            .queries
            .execute(&sql, Some(&dataset.key), cancel)
            .await?;
        let entry = CacheEntry {
            chart_type: infer_chart_type(&request.question, &sql),
            sql,
            columns: rows.columns,
            rows: rows.rows,
        };
        if !retry {
            self.cache.put(key, entry.clone());
        }

        tracing::info!(
            dataset = %dataset.key,
            retry,
            rows = entry.rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "single-shot query answered"
        );
        Ok(QueryResponse::from_entry(entry, false))
    }
}
