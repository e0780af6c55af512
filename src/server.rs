//! HTTP Server
//!
//! axum routes exposing the step executor and the single-shot query path.
//!
//! - `POST /api/analyze` - one step of a deep analysis
//! - `POST /api/query` - single-shot question, `X-Cache: HIT|MISS`
//! - `GET /health` - liveness and configured datasets

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderValue,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use deep_query_core::{StepRequest, StepResponse};

use crate::services::analysis::StepExecutor;
use crate::services::single_shot::{QueryRequest, QueryService};
use crate::utils::error::{AppError, AppResult};

/// Shared handler state.
pub struct AppState {
    pub steps: Arc<StepExecutor>,
    pub queries: Arc<QueryService>,
    /// Cancelled on shutdown; every request runs under a child token
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(steps: Arc<StepExecutor>, queries: Arc<QueryService>) -> Self {
        Self {
            steps,
            queries,
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/analyze", post(analyze))
        .route("/api/query", post(query))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn body_error(rejection: JsonRejection) -> AppError {
    AppError::validation(format!("Invalid request body: {}", rejection.body_text()))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let datasets: Vec<String> = state
        .steps
        .config()
        .datasets
        .iter()
        .map(|d| d.key.clone())
        .collect();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "datasets": datasets,
    }))
}

async fn analyze(
    State(state): State<Arc<AppState>>,
    body: Result<Json<StepRequest>, JsonRejection>,
) -> AppResult<Json<StepResponse>> {
    let Json(request) = body.map_err(body_error)?;
    let cancel = state.shutdown.child_token();
    let response = state.steps.run_step(&request, &cancel).await?;
    Ok(Json(response))
}

async fn query(
    State(state): State<Arc<AppState>>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> AppResult<Response> {
    let Json(request) = body.map_err(body_error)?;
    let cancel = state.shutdown.child_token();
    let answer = state.queries.ask(&request, &cancel).await?;
    let cache_status = if answer.cached { "HIT" } else { "MISS" };
    let mut response = Json(answer).into_response();
    response
        .headers_mut()
        .insert("x-cache", HeaderValue::from_static(cache_status));
    Ok(response)
}
