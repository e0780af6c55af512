//! HTTP Step Loop Integration Tests
//!
//! The orchestrator driving `/api/analyze` on a live router over a loopback
//! socket, as `deep-query analyze --server` does.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;

use deep_query::models::settings::AppConfig;
use deep_query::services::analysis::{
    AnalysisRequest, AnalysisStatus, HttpStepClient, Orchestrator, StepClient,
    STEP_REQUEST_TIMEOUT,
};
use deep_query::services::single_shot::QueryService;
use deep_query::{build_router, AppError, AppState};
use deep_query_core::{ResultSet, StepRequest};

use crate::support::{replies, step_executor, FakeEngine, FakeModel, Recorder};

const PLAN: &str = r#"{"plan":[{"stepNumber":1,"title":"Top states","purpose":"sum and rank"}],"reasoning":"One query.","complexity":"simple","stepIndex":0,"done":false}"#;

async fn spawn_server(model: Arc<FakeModel>, engine: Arc<FakeEngine>) -> SocketAddr {
    let steps = step_executor(model.clone(), engine.clone());
    let queries = Arc::new(QueryService::new(model, engine, Arc::new(AppConfig::default())));
    let app = build_router(Arc::new(AppState::new(steps, queries)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn http_client(addr: SocketAddr) -> Arc<dyn StepClient> {
    Arc::new(HttpStepClient::new(&format!("http://{}", addr), STEP_REQUEST_TIMEOUT).unwrap())
}

#[tokio::test]
async fn test_analysis_over_http_completes() {
    let model = FakeModel::new(replies(&[
        PLAN,
        r#"{"step":{"title":"Top states","sql":"SELECT state, SUM(total_paid) AS total FROM claims GROUP BY 1 ORDER BY 2 DESC LIMIT 5","chartType":"bar","insight":"California leads."},"summary":"California spends the most.","done":true,"stepIndex":1}"#,
    ]));
    let engine = FakeEngine::new(vec![Ok(ResultSet::new(
        vec!["state".into(), "total".into()],
        vec![vec![json!("CA"), json!(10)], vec![json!("NY"), json!(8)]],
    ))]);
    let addr = spawn_server(model.clone(), engine.clone()).await;

    let recorder = Arc::new(Recorder::default());
    let orch = Orchestrator::new(http_client(addr), 5)
        .with_store(recorder.clone())
        .with_feed(recorder.clone());
    let state = orch.run(AnalysisRequest::new("top 5 states by spending")).await;

    assert_eq!(state.status, AnalysisStatus::Complete);
    assert_eq!(state.summary.as_deref(), Some("California spends the most."));
    assert_eq!(state.steps.len(), 1);
    assert_eq!(state.steps[0].rows.len(), 2);
    assert_eq!(state.plan.as_ref().unwrap().title_for_step(1), "Top states");
    assert_eq!(model.calls(), 2);
    assert_eq!(engine.statements().len(), 1);
    assert_eq!(recorder.saved.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_out_of_scope_surfaces_cannot_answer() {
    let model = FakeModel::new(vec![]);
    let addr = spawn_server(model.clone(), FakeEngine::new(vec![])).await;
    let client = http_client(addr);

    let request: StepRequest = serde_json::from_value(json!({
        "question": "Which ICD-10 diagnosis codes cost the most?",
        "sessionId": "s-1",
        "stepIndex": 0
    }))
    .unwrap();
    let err = client
        .run_step(&request, &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::CannotAnswer(_)), "{:?}", err);
    assert_eq!(model.calls(), 0);

    let orch = Orchestrator::new(client, 5);
    let state = orch
        .run(AnalysisRequest::new("Which ICD-10 diagnosis codes cost the most?"))
        .await;
    assert_eq!(state.status, AnalysisStatus::Error);
    assert!(state.error.is_some());
    assert!(state.steps.is_empty());
}

#[tokio::test]
async fn test_validation_errors_keep_their_message() {
    let addr = spawn_server(FakeModel::new(vec![]), FakeEngine::new(vec![])).await;
    let client = http_client(addr);

    let request: StepRequest = serde_json::from_value(json!({
        "question": "top states",
        "sessionId": "s-1",
        "stepIndex": 7
    }))
    .unwrap();
    let err = client
        .run_step(&request, &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)), "{:?}", err);
    assert_eq!(err.to_string(), "stepIndex must be 0-4.");
}

#[tokio::test]
async fn test_unreachable_server_fails_the_run() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let orch = Orchestrator::new(http_client(addr), 5);
    let state = orch.run(AnalysisRequest::new("top 5 states by spending")).await;

    assert_eq!(state.status, AnalysisStatus::Error);
    assert!(state
        .error
        .unwrap()
        .starts_with("Step endpoint unreachable"));
}
