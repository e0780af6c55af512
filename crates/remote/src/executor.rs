//! Remote Query Executor
//!
//! Sends validated SQL to a dataset's query service and returns the tabular
//! result. The executor never retries: a retry means regenerating the query,
//! which is the step executor's job.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use deep_query_core::{ResultSet, MAX_RESULT_ROWS};

use crate::dataset::DatasetRegistry;
use crate::error::{QueryError, QueryResult};

/// Default bound on a single remote query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(90);

/// Executes SQL against a remote tabular engine.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run `sql` against `dataset` (the default dataset when `None`).
    ///
    /// Resolves with [`QueryError::Cancelled`] as soon as `cancel` fires.
    async fn execute(
        &self,
        sql: &str,
        dataset: Option<&str>,
        cancel: &CancellationToken,
    ) -> QueryResult<ResultSet>;
}

fn limit_clause() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\blimit\b").expect("valid pattern"))
}

/// Append `LIMIT cap` to statements without a limit clause of their own.
pub fn apply_row_cap(sql: &str, cap: usize) -> String {
    let statement = sql
        .trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if limit_clause().is_match(statement) {
        statement.to_string()
    } else {
        format!("{} LIMIT {}", statement, cap)
    }
}

/// Engine reply; either the result or an `error` message.
#[derive(Debug, Deserialize)]
struct EngineResponse {
    #[serde(default)]
    columns: Option<Vec<String>>,
    #[serde(default)]
    rows: Option<Vec<Vec<serde_json::Value>>>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP implementation: `POST {base}/query` with body `{ "sql": ... }`.
pub struct HttpQueryExecutor {
    client: reqwest::Client,
    registry: DatasetRegistry,
    timeout: Duration,
}

impl HttpQueryExecutor {
    pub fn new(registry: DatasetRegistry, timeout: Duration) -> QueryResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QueryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            registry,
            timeout,
        })
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    fn map_transport(&self, err: reqwest::Error) -> QueryError {
        if err.is_timeout() {
            QueryError::Timeout {
                seconds: self.timeout.as_secs(),
            }
        } else {
            QueryError::Transport(err.to_string())
        }
    }

    async fn send(&self, url: &str, api_key: Option<&str>, sql: &str) -> QueryResult<ResultSet> {
        let mut request = self
            .client
            .post(url)
            .json(&serde_json::json!({ "sql": sql }));
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.map_transport(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_transport(e))?;
        let parsed: Option<EngineResponse> = serde_json::from_str(&body).ok();

        if !status.is_success() {
            let message = parsed
                .and_then(|p| p.error)
                .unwrap_or_else(|| format!("Query service error: {}", status.as_u16()));
            return Err(QueryError::Remote(message));
        }

        let parsed = parsed.ok_or_else(|| QueryError::Decode(truncate(&body, 200)))?;
        if let Some(error) = parsed.error {
            return Err(QueryError::Remote(error));
        }
        Ok(ResultSet::new(
            parsed.columns.unwrap_or_default(),
            parsed.rows.unwrap_or_default(),
        ))
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute(
        &self,
        sql: &str,
        dataset: Option<&str>,
        cancel: &CancellationToken,
    ) -> QueryResult<ResultSet> {
        let endpoint = self.registry.resolve(dataset)?;
        let url = endpoint.query_endpoint()?;
        let capped = apply_row_cap(sql, MAX_RESULT_ROWS);
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueryError::Cancelled),
            res = self.send(&url, endpoint.api_key.as_deref(), &capped) => res,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(rs) => tracing::info!(
                dataset = %endpoint.key,
                rows = rs.row_count(),
                elapsed_ms,
                "remote query succeeded"
            ),
            Err(e) => tracing::warn!(
                dataset = %endpoint.key,
                elapsed_ms,
                error = %e,
                "remote query failed"
            ),
        }
        result
    }
}
