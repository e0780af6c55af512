//! HTTP Client Factory
//!
//! Builds the reqwest clients used by the providers and sends their JSON
//! requests. Every client carries a hard request timeout.

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::types::{LlmError, LlmResult};

/// Build a `reqwest::Client` whose requests fail after `timeout`.
pub fn build_http_client(timeout: Duration) -> LlmResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| LlmError::Other(format!("failed to build HTTP client: {}", e)))
}

/// Send a prepared request and decode a successful JSON body.
pub(crate) async fn send_json<R: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    provider: &'static str,
    timeout_secs: u64,
) -> LlmResult<R> {
    let response = request
        .send()
        .await
        .map_err(|e| LlmError::from_transport(e, timeout_secs))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| LlmError::from_transport(e, timeout_secs))?;

    if !status.is_success() {
        tracing::warn!(provider, status = status.as_u16(), "completion request rejected");
        return Err(LlmError::from_status(status.as_u16(), &body, provider));
    }
    serde_json::from_str(&body).map_err(|e| LlmError::Parse(e.to_string()))
}
