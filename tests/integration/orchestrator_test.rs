//! Orchestrator Integration Tests
//!
//! Full runs of the step loop with the step executor in-process.

use std::sync::Arc;

use serde_json::json;

use deep_query::services::analysis::orchestrator::BUDGET_EXHAUSTED_SUMMARY;
use deep_query::services::analysis::{AnalysisRequest, AnalysisStatus};
use deep_query_core::{ResultSet, StepStatus};
use deep_query_llm::MessageRole;
use deep_query_remote::QueryError;

use crate::support::{
    local_orchestrator, narrated_orchestrator, replies, FakeEngine, FakeModel, Recorder, HANG,
};

const PLAN: &str = r#"{"plan":["Aggregate by state: group total payments by state","Rank: order by total and keep five"],"reasoning":"Sum then rank.","complexity":"simple","stepIndex":0,"done":false}"#;

fn state_rows() -> ResultSet {
    ResultSet::new(
        vec!["state".into(), "total_paid".into()],
        vec![
            vec![json!("CA"), json!(9_000_000)],
            vec![json!("NY"), json!(7_500_000)],
            vec![json!("TX"), json!(5_000_000)],
        ],
    )
}

fn continuing(title: &str) -> String {
    json!({
        "step": {
            "title": title,
            "sql": "SELECT state, SUM(total_paid) FROM claims GROUP BY 1 LIMIT 5",
            "chartType": "bar",
            "insight": format!("{} insight", title)
        },
        "done": false
    })
    .to_string()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_top_states_completes_in_one_step() {
    let model = FakeModel::new(replies(&[
        PLAN,
        r#"{"step":{"title":"Top states","sql":"SELECT state, SUM(total_paid) AS total_paid FROM claims GROUP BY state ORDER BY total_paid DESC LIMIT 5","chartType":"bar","insight":"California leads."},"summary":"California, New York and Texas account for most spending.","done":true,"stepIndex":1}"#,
    ]));
    let engine = FakeEngine::new(vec![Ok(state_rows())]);
    let recorder = Arc::new(Recorder::default());
    let orch = local_orchestrator(model.clone(), engine, recorder.clone());

    let state = orch
        .run(AnalysisRequest::new("top 5 states by spending"))
        .await;

    assert_eq!(state.status, AnalysisStatus::Complete);
    assert_eq!(state.steps.len(), 1);
    assert_eq!(state.plan.as_ref().unwrap().len(), 2);
    assert!(!state.summary.as_deref().unwrap().is_empty());
    assert_eq!(state.steps[0].status, StepStatus::Complete);
    assert_eq!(state.steps[0].rows.len(), 3);
    assert_eq!(model.calls(), 2);

    let saved = recorder.saved.lock().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].session_id, state.session_id.clone().unwrap());
    assert_eq!(saved[0].plan[0], "Aggregate by state: group total payments by state");
    assert_eq!(recorder.feed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_narration_grounds_saved_analysis_in_results() {
    let step1 = continuing("Aggregate by state");
    let model = FakeModel::new(replies(&[
        PLAN,
        &step1,
        r#"{"done":true,"summary":"States were ranked.","stepIndex":2}"#,
    ]));
    let narrator = FakeModel::new(replies(&[
        "CA paid 9,000,000, ahead of NY at 7,500,000.",
        "California leads spending at 9,000,000, followed by New York and Texas.",
    ]));
    let engine = FakeEngine::new(vec![Ok(state_rows())]);
    let recorder = Arc::new(Recorder::default());
    let orch = narrated_orchestrator(model.clone(), narrator.clone(), engine, recorder.clone());

    let state = orch.run(AnalysisRequest::new("top 5 states by spending")).await;

    assert_eq!(state.status, AnalysisStatus::Complete);
    assert_eq!(
        state.steps[0].insight.as_deref(),
        Some("CA paid 9,000,000, ahead of NY at 7,500,000.")
    );
    assert_eq!(
        state.summary.as_deref(),
        Some("California leads spending at 9,000,000, followed by New York and Texas.")
    );
    assert_eq!(model.calls(), 3);
    assert_eq!(narrator.calls(), 2);

    // The next step prompt replays the grounded insight, not the draft.
    let turns = &model.requests()[2];
    assert!(turns
        .iter()
        .any(|m| m.content.contains("Interpretation: CA paid 9,000,000")));
    assert!(!turns
        .iter()
        .any(|m| m.content.contains("Aggregate by state insight")));

    let saved = recorder.saved.lock().unwrap();
    assert_eq!(saved[0].summary, state.summary.clone().unwrap());
}

#[tokio::test]
async fn test_budget_bounds_model_calls() {
    let step1 = continuing("One");
    let step2 = continuing("Two");
    let step3 = continuing("Three");
    let step4 = continuing("Four");
    let step5 = continuing("Five");
    let model = FakeModel::new(replies(&[PLAN, &step1, &step2, &step3, &step4, &step5]));
    let engine = FakeEngine::new((0..5).map(|_| Ok(state_rows())).collect());
    let recorder = Arc::new(Recorder::default());
    let orch = local_orchestrator(model.clone(), engine, recorder.clone());

    let state = orch.run(AnalysisRequest::new("spending by state")).await;

    assert_eq!(model.calls(), 5);
    assert_eq!(state.status, AnalysisStatus::Complete);
    assert_eq!(state.steps.len(), 4);
    let summary = state.summary.unwrap();
    assert!(summary.starts_with(BUDGET_EXHAUSTED_SUMMARY));
    assert!(summary.contains("Four insight"));
    assert_eq!(recorder.saved.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_binder_error_is_repaired_once() {
    let model = FakeModel::new(replies(&[
        PLAN,
        r#"{"step":{"title":"Top states","sql":"SELECT stat, SUM(total_paid) FROM claims GROUP BY 1 LIMIT 5","chartType":"bar","insight":"California leads."},"done":true,"summary":"CA leads."}"#,
        r#"{"step":{"title":"Top states","sql":"SELECT state, SUM(total_paid) FROM claims GROUP BY 1 LIMIT 5","chartType":"bar"}}"#,
    ]));
    let engine = FakeEngine::new(vec![
        Err(QueryError::Remote(
            "Binder Error: Referenced column \"stat\" not found in FROM clause!".into(),
        )),
        Ok(state_rows()),
    ]);
    let orch = local_orchestrator(model.clone(), engine.clone(), Arc::new(Recorder::default()));

    let state = orch.run(AnalysisRequest::new("top 5 states by spending")).await;

    assert_eq!(state.status, AnalysisStatus::Complete);
    let step = &state.steps[0];
    assert_eq!(
        step.sql.as_deref(),
        Some("SELECT state, SUM(total_paid) FROM claims GROUP BY 1 LIMIT 5")
    );
    assert!(step.error.is_none());
    assert_eq!(engine.statements().len(), 2);

    let repair = &model.requests()[2];
    let last = repair.last().unwrap();
    assert_eq!(last.role, MessageRole::User);
    assert!(last.content.contains("Binder Error: Referenced column"));
    assert_eq!(
        repair[repair.len() - 2].content,
        "SELECT stat, SUM(total_paid) FROM claims GROUP BY 1 LIMIT 5"
    );
}

#[tokio::test]
async fn test_failed_repair_keeps_original_error_and_continues() {
    let model = FakeModel::new(replies(&[
        PLAN,
        r#"{"step":{"title":"Top states","sql":"SELECT stat FROM claims","insight":"x"},"done":false}"#,
        r#"{"step":{"sql":"SELECT stats FROM claims"}}"#,
        r#"{"done":true,"summary":"Could not rank states."}"#,
    ]));
    let engine = FakeEngine::new(vec![
        Err(QueryError::Remote("Binder Error: column stat not found".into())),
        Err(QueryError::Remote("Binder Error: column stats not found".into())),
    ]);
    let orch = local_orchestrator(model.clone(), engine.clone(), Arc::new(Recorder::default()));

    let state = orch.run(AnalysisRequest::new("top 5 states by spending")).await;

    assert_eq!(state.status, AnalysisStatus::Complete);
    assert_eq!(state.steps.len(), 1);
    assert_eq!(state.steps[0].status, StepStatus::Error);
    assert_eq!(
        state.steps[0].error.as_deref(),
        Some("Binder Error: column stat not found")
    );
    // plan, step 1, one repair, step 2
    assert_eq!(model.calls(), 4);
    assert_eq!(engine.statements().len(), 2);

    let step2_turns = &model.requests()[3];
    assert!(step2_turns
        .iter()
        .any(|m| m.content.contains("Binder Error: column stat not found")));
}

#[tokio::test]
async fn test_results_are_replayed_into_next_prompt() {
    let step1 = continuing("Aggregate by state");
    let model = FakeModel::new(replies(&[
        PLAN,
        &step1,
        r#"{"done":true,"summary":"Done."}"#,
    ]));
    let engine = FakeEngine::new(vec![Ok(state_rows())]);
    let orch = local_orchestrator(model.clone(), engine, Arc::new(Recorder::default()));

    let state = orch.run(AnalysisRequest::new("top 5 states by spending")).await;
    assert_eq!(state.status, AnalysisStatus::Complete);
    assert_eq!(state.ledger.len(), 2);

    let turns = &model.requests()[2];
    assert!(turns[0].content.contains("top 5 states by spending"));
    assert!(turns
        .iter()
        .any(|m| m.role == MessageRole::Assistant && m.content.contains("Step 1: Aggregate by state")));
    assert!(turns.iter().any(|m| m.content.contains("SHAPE: 3 rows")));
}

// ============================================================================
// Failure and cancellation
// ============================================================================

#[tokio::test]
async fn test_unparseable_reply_is_an_error() {
    let model = FakeModel::new(replies(&[PLAN, "Sorry, I cannot help with that."]));
    let recorder = Arc::new(Recorder::default());
    let orch = local_orchestrator(model, FakeEngine::new(vec![]), recorder.clone());

    let state = orch.run(AnalysisRequest::new("top 5 states by spending")).await;

    assert_eq!(state.status, AnalysisStatus::Error);
    assert!(state.error.unwrap().starts_with("Failed to parse analysis response"));
    assert!(state.steps.is_empty());
    assert!(state.plan.is_some());
    assert!(recorder.saved.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_sql_aborts_without_execution() {
    let model = FakeModel::new(replies(&[
        PLAN,
        r#"{"step":{"title":"Cleanup","sql":"SELECT 1; DROP TABLE claims","insight":"x"},"done":false}"#,
    ]));
    let engine = FakeEngine::new(vec![]);
    let orch = local_orchestrator(model, engine.clone(), Arc::new(Recorder::default()));

    let state = orch.run(AnalysisRequest::new("top 5 states by spending")).await;

    assert_eq!(state.status, AnalysisStatus::Error);
    assert_eq!(
        state.error.as_deref(),
        Some("Forbidden SQL keyword detected: DROP")
    );
    assert!(engine.statements().is_empty());
}

#[tokio::test]
async fn test_out_of_scope_question_fails_at_planning() {
    let model = FakeModel::new(vec![]);
    let orch = local_orchestrator(model.clone(), FakeEngine::new(vec![]), Arc::new(Recorder::default()));

    let state = orch
        .run(AnalysisRequest::new("What is the mortality rate for dialysis patients?"))
        .await;

    assert_eq!(state.status, AnalysisStatus::Error);
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_cancel_keeps_finished_steps_and_restart_gets_new_session() {
    let step1 = continuing("Aggregate by state");
    let model = FakeModel::new(replies(&[
        PLAN,
        &step1,
        HANG,
        PLAN,
        r#"{"done":true,"summary":"Nothing further."}"#,
    ]));
    let engine = FakeEngine::new(vec![Ok(state_rows())]);
    let recorder = Arc::new(Recorder::default());
    let orch = local_orchestrator(model.clone(), engine, recorder.clone());

    let mut rx = orch.subscribe();
    let runner = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run(AnalysisRequest::new("top 5 states by spending")).await })
    };
    rx.wait_for(|s| s.current_step == 2 && s.steps.len() == 2)
        .await
        .unwrap();
    orch.cancel();

    let cancelled = runner.await.unwrap();
    assert_eq!(cancelled.status, AnalysisStatus::Cancelled);
    assert_eq!(cancelled.steps.len(), 1);
    assert_eq!(cancelled.steps[0].status, StepStatus::Complete);
    assert_eq!(model.calls(), 3);
    assert!(recorder.saved.lock().unwrap().is_empty());

    let next = orch.run(AnalysisRequest::new("top 5 states by spending")).await;
    assert_eq!(next.status, AnalysisStatus::Complete);
    assert_ne!(next.session_id, cancelled.session_id);
    assert!(next.steps.is_empty());
}

#[tokio::test]
async fn test_starting_a_new_run_cancels_the_previous_one() {
    let model = FakeModel::new(replies(&[
        HANG,
        PLAN,
        r#"{"done":true,"summary":"Done."}"#,
    ]));
    let orch = local_orchestrator(model, FakeEngine::new(vec![]), Arc::new(Recorder::default()));

    let mut rx = orch.subscribe();
    let first = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run(AnalysisRequest::new("first question")).await })
    };
    rx.wait_for(|s| s.question == "first question").await.unwrap();
    tokio::task::yield_now().await;

    let second = orch.run(AnalysisRequest::new("second question")).await;
    let first = first.await.unwrap();

    assert_eq!(first.status, AnalysisStatus::Cancelled);
    assert_eq!(second.status, AnalysisStatus::Complete);
    assert_eq!(orch.state().question, "second question");
}
