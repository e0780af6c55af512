//! Step Clients
//!
//! The orchestrator drives a run through a `StepClient`: either the step
//! executor in-process or a remote `/api/analyze` endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use deep_query_core::{StepRequest, StepResponse};

use crate::utils::error::{AppError, AppResult};

use super::step_executor::StepExecutor;

/// Default client-side bound on one step round trip.
pub const STEP_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs one step of the analysis loop.
#[async_trait]
pub trait StepClient: Send + Sync {
    async fn run_step(
        &self,
        request: &StepRequest,
        cancel: &CancellationToken,
    ) -> AppResult<StepResponse>;
}

/// Calls the step executor in-process.
pub struct LocalStepClient {
    executor: Arc<StepExecutor>,
}

impl LocalStepClient {
    pub fn new(executor: Arc<StepExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl StepClient for LocalStepClient {
    async fn run_step(
        &self,
        request: &StepRequest,
        cancel: &CancellationToken,
    ) -> AppResult<StepResponse> {
        self.executor.run_step(request, cancel).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: Option<String>,
    #[serde(default)]
    cannot_answer: bool,
}

/// Posts steps to a running `deep-query serve` instance.
pub struct HttpStepClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpStepClient {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:3000`.
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/analyze", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, request: &StepRequest) -> AppResult<StepResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Upstream {
                        status: 504,
                        message: "Analysis step timed out.".into(),
                    }
                } else {
                    AppError::Upstream {
                        status: 502,
                        message: format!("Step endpoint unreachable: {}", e),
                    }
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| AppError::Upstream {
            status: 502,
            message: format!("Failed to read step response: {}", e),
        })?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| AppError::model_response(format!("invalid step response: {}", e)));
        }
        Err(error_from_response(status.as_u16(), &body))
    }
}

/// Rebuild the server's error from its status and `{error}` body.
fn error_from_response(status: u16, body: &str) -> AppError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let cannot_answer = parsed.as_ref().is_some_and(|b| b.cannot_answer);
    let message = parsed
        .and_then(|b| b.error)
        .unwrap_or_else(|| format!("Step request failed with status {}", status));

    match status {
        422 if cannot_answer => AppError::CannotAnswer(message),
        400 => AppError::Validation(message),
        499 => AppError::Cancelled,
        _ => AppError::Upstream { status, message },
    }
}

#[async_trait]
impl StepClient for HttpStepClient {
    async fn run_step(
        &self,
        request: &StepRequest,
        cancel: &CancellationToken,
    ) -> AppResult<StepResponse> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            res = self.post(request) => res,
        }
    }
}
