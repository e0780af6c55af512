//! Deep Analysis Orchestrator
//!
//! Drives the step loop for one session at a time. The visible state is a
//! pure reducer over `AnalysisEvent`s; the orchestrator only feeds it events
//! and publishes each new state on a watch channel.
//!
//! ## Lifecycle
//!
//! ```text
//! idle -> planning -> running -> complete | error | cancelled
//! ```
//!
//! Step 0 produces the plan and no card. Each execution step gets a
//! placeholder card titled from the current plan, filled in when its
//! response arrives. Cancellation wins over any in-flight result.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use deep_query_core::{
    Complexity, Plan, PriorAnalysis, Step, StepOutcome, StepRecord, StepRequest, StepResponse,
    StepResult, StepStatus,
};

use crate::storage::analysis_store::{AnalysisStore, CompletedAnalysis, FeedItem, FeedNotifier};
use crate::utils::error::AppError;

use super::client::StepClient;
use super::step_executor::{record_of, synthesize_summary};

/// Summary used when the step budget runs out before the model finishes.
pub const BUDGET_EXHAUSTED_SUMMARY: &str = "Analysis reached the maximum number of steps.";

/// Title of the plan's ledger entry.
pub const PLAN_RECORD_TITLE: &str = "Analysis plan";

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    #[default]
    Idle,
    Planning,
    Running,
    Complete,
    Error,
    Cancelled,
}

impl AnalysisStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisStatus::Complete | AnalysisStatus::Error | AnalysisStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AnalysisStatus::Planning | AnalysisStatus::Running)
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AnalysisStatus::Idle => "idle",
            AnalysisStatus::Planning => "planning",
            AnalysisStatus::Running => "running",
            AnalysisStatus::Complete => "complete",
            AnalysisStatus::Error => "error",
            AnalysisStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Everything a caller renders for the current session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisState {
    pub status: AnalysisStatus,
    pub session_id: Option<String>,
    pub question: String,
    pub years: Option<Vec<i32>>,
    pub dataset: Option<String>,
    pub plan: Option<Plan>,
    pub reasoning: Option<String>,
    pub complexity: Option<Complexity>,
    /// Visible cards, in step order
    pub steps: Vec<Step>,
    /// Append-only context replayed into later prompts
    pub ledger: Vec<StepRecord>,
    pub summary: Option<String>,
    pub error: Option<String>,
    /// Step whose response is awaited
    pub current_step: usize,
}

/// Inputs to the reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisEvent {
    Started {
        session_id: String,
        question: String,
        years: Option<Vec<i32>>,
        dataset: Option<String>,
    },
    StepStarted {
        step_index: usize,
    },
    Outcome(StepResponse),
    Failed {
        message: String,
    },
    Cancelled,
    BudgetExhausted,
    Cleared,
}

impl AnalysisState {
    /// Apply `event`. Events that do not fit the current status are ignored,
    /// so late results after a cancel or failure never change the state.
    pub fn apply(mut self, event: AnalysisEvent) -> AnalysisState {
        match event {
            AnalysisEvent::Started {
                session_id,
                question,
                years,
                dataset,
            } => AnalysisState {
                status: AnalysisStatus::Planning,
                session_id: Some(session_id),
                question,
                years,
                dataset,
                ..Default::default()
            },
            AnalysisEvent::Cleared => AnalysisState::default(),
            _ if !self.status.is_active() => self,
            AnalysisEvent::StepStarted { step_index } => {
                self.current_step = step_index;
                if step_index > 0 {
                    let title = self
                        .plan
                        .as_ref()
                        .map(|p| p.title_for_step(step_index))
                        .unwrap_or_else(|| format!("Step {}", step_index));
                    self.steps.push(Step::placeholder(step_index, title));
                    self.status = AnalysisStatus::Running;
                }
                self
            }
            AnalysisEvent::Outcome(response) => {
                if response.step_index != self.current_step {
                    tracing::warn!(
                        expected = self.current_step,
                        received = response.step_index,
                        "ignoring out-of-order step response"
                    );
                    return self;
                }
                self.apply_outcome(response.step_index, response.outcome)
            }
            AnalysisEvent::Failed { message } => {
                self.drop_placeholders();
                self.status = AnalysisStatus::Error;
                self.error = Some(message);
                self
            }
            AnalysisEvent::Cancelled => {
                self.drop_placeholders();
                self.status = AnalysisStatus::Cancelled;
                self
            }
            AnalysisEvent::BudgetExhausted => {
                let findings = synthesize_summary(&self.question, &self.ledger);
                let summary = if self.ledger.iter().any(|r| r.step_index > 0) {
                    format!("{}\n\n{}", BUDGET_EXHAUSTED_SUMMARY, findings)
                } else {
                    BUDGET_EXHAUSTED_SUMMARY.to_string()
                };
                self.complete(summary)
            }
        }
    }

    fn apply_outcome(mut self, index: usize, outcome: StepOutcome) -> AnalysisState {
        match outcome {
            StepOutcome::Plan {
                plan,
                reasoning,
                complexity,
            } => {
                let rendered = if reasoning.is_empty() {
                    plan.render()
                } else {
                    format!("{}\n\nReasoning: {}", plan.render(), reasoning)
                };
                self.ledger.push(StepRecord {
                    step_index: 0,
                    title: PLAN_RECORD_TITLE.to_string(),
                    insight: Some(rendered),
                    ..Default::default()
                });
                self.plan = Some(plan);
                self.reasoning = Some(reasoning);
                self.complexity = Some(complexity);
                self
            }
            StepOutcome::Continue {
                step,
                reasoning,
                revised_plan,
            } => {
                self.record(index, step);
                if reasoning.is_some() {
                    self.reasoning = reasoning;
                }
                if let Some(plan) = revised_plan {
                    self.plan = Some(plan);
                }
                self
            }
            StepOutcome::Finished { step, summary } => {
                self.record(index, step);
                self.complete(summary)
            }
            StepOutcome::CannotAnswer {
                step,
                done,
                summary,
            } => {
                self.record(index, step);
                if done {
                    let summary = summary
                        .unwrap_or_else(|| synthesize_summary(&self.question, &self.ledger));
                    self.complete(summary)
                } else {
                    self
                }
            }
            StepOutcome::Summary { summary } => self.complete(summary),
        }
    }

    /// Fill the card for `index` and append its ledger entry.
    fn record(&mut self, index: usize, result: StepResult) {
        self.ledger.push(record_of(index, &result));
        let card = card_from(index, result);
        match self.steps.iter_mut().find(|s| s.index == index) {
            Some(slot) => *slot = card,
            None => self.steps.push(card),
        }
    }

    fn complete(mut self, summary: String) -> AnalysisState {
        self.drop_placeholders();
        self.status = AnalysisStatus::Complete;
        self.summary = Some(summary);
        self
    }

    fn drop_placeholders(&mut self) {
        self.steps.retain(|s| !s.is_placeholder());
    }
}

fn card_from(index: usize, result: StepResult) -> Step {
    let status = if result.error.is_some() {
        StepStatus::Error
    } else {
        StepStatus::Complete
    };
    Step {
        index,
        title: result.title,
        sql: result.sql,
        chart_type: result.chart_type,
        columns: result.columns.unwrap_or_default(),
        rows: result.rows.unwrap_or_default(),
        insight: result.insight.or(result.cannot_answer),
        error: result.error,
        status,
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Parameters of one run.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub question: String,
    pub years: Option<Vec<i32>>,
    pub dataset: Option<String>,
    /// Earlier analyses this question follows up on
    pub prior_analyses: Vec<PriorAnalysis>,
}

impl AnalysisRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Default::default()
        }
    }
}

/// Runs deep analyses, one session at a time.
pub struct Orchestrator {
    client: Arc<dyn StepClient>,
    max_steps: usize,
    store: Option<Arc<dyn AnalysisStore>>,
    feed: Option<Arc<dyn FeedNotifier>>,
    state: watch::Sender<AnalysisState>,
    /// Session id and token of the run in flight
    active: Mutex<Option<(String, CancellationToken)>>,
}

impl Orchestrator {
    /// `max_steps` counts the plan step.
    pub fn new(client: Arc<dyn StepClient>, max_steps: usize) -> Self {
        let (state, _) = watch::channel(AnalysisState::default());
        Self {
            client,
            max_steps,
            store: None,
            feed: None,
            state,
            active: Mutex::new(None),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn AnalysisStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_feed(mut self, feed: Arc<dyn FeedNotifier>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<AnalysisState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> AnalysisState {
        self.state.borrow().clone()
    }

    /// Begin a new session, cancelling any session still in flight.
    fn start(&self, request: &AnalysisRequest) -> (String, CancellationToken) {
        let session_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((previous, token)) = active.replace((session_id.clone(), cancel.clone())) {
                tracing::info!(session_id = %previous, "cancelling superseded analysis");
                token.cancel();
            }
        }
        self.state.send_replace(AnalysisState::default().apply(AnalysisEvent::Started {
            session_id: session_id.clone(),
            question: request.question.clone(),
            years: request.years.clone(),
            dataset: request.dataset.clone(),
        }));
        tracing::info!(session_id = %session_id, "analysis started");
        (session_id, cancel)
    }

    /// Cancel the active session, if any.
    pub fn cancel(&self) {
        let token = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((_, token)) = token {
            token.cancel();
        }
        self.state.send_if_modified(|state| {
            if !state.status.is_active() {
                return false;
            }
            tracing::info!(session_id = ?state.session_id, "analysis cancelled");
            *state = std::mem::take(state).apply(AnalysisEvent::Cancelled);
            true
        });
    }

    /// Cancel and return to idle.
    pub fn clear(&self) {
        self.cancel();
        self.state.send_replace(AnalysisState::default());
    }

    /// Apply `event` if `session_id` is still the current session.
    fn dispatch(&self, session_id: &str, event: AnalysisEvent) -> bool {
        self.state.send_if_modified(|state| {
            if state.session_id.as_deref() != Some(session_id) {
                return false;
            }
            let previous = state.clone();
            *state = previous.clone().apply(event);
            *state != previous
        })
    }

    fn current(&self, session_id: &str) -> Option<AnalysisState> {
        let state = self.state.borrow();
        (state.session_id.as_deref() == Some(session_id)).then(|| state.clone())
    }

    /// Run a whole analysis and return its final state.
    pub async fn run(&self, request: AnalysisRequest) -> AnalysisState {
        let (session_id, cancel) = self.start(&request);

        for step_index in 0..self.max_steps {
            self.dispatch(&session_id, AnalysisEvent::StepStarted { step_index });
            let Some(state) = self.current(&session_id) else {
                break;
            };
            if !state.status.is_active() {
                break;
            }

            let step_request = StepRequest {
                question: request.question.clone(),
                years: request.years.clone(),
                session_id: session_id.clone(),
                step_index,
                previous_steps: state.ledger.clone(),
                dataset: request.dataset.clone(),
                prior_analyses: if step_index == 0 {
                    request.prior_analyses.clone()
                } else {
                    Vec::new()
                },
            };

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AppError::Cancelled),
                res = self.client.run_step(&step_request, &cancel) => res,
            };

            match result {
                _ if cancel.is_cancelled() => {
                    self.dispatch(&session_id, AnalysisEvent::Cancelled);
                    break;
                }
                Ok(response) => {
                    tracing::debug!(
                        session_id = %session_id,
                        step_index,
                        done = response.is_done(),
                        "step response received"
                    );
                    self.dispatch(&session_id, AnalysisEvent::Outcome(response));
                }
                Err(e) if e.is_cancelled() => {
                    self.dispatch(&session_id, AnalysisEvent::Cancelled);
                    break;
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, step_index, error = %e, "analysis step failed");
                    self.dispatch(
                        &session_id,
                        AnalysisEvent::Failed {
                            message: e.to_string(),
                        },
                    );
                    break;
                }
            }
        }

        if self
            .current(&session_id)
            .is_some_and(|s| s.status.is_active())
        {
            tracing::info!(session_id = %session_id, "step budget exhausted");
            self.dispatch(&session_id, AnalysisEvent::BudgetExhausted);
        }

        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.as_ref().is_some_and(|(id, _)| *id == session_id) {
                active.take();
            }
        }

        let final_state = self.current(&session_id).unwrap_or_else(|| AnalysisState {
            status: AnalysisStatus::Cancelled,
            session_id: Some(session_id.clone()),
            question: request.question.clone(),
            ..Default::default()
        });
        if final_state.status == AnalysisStatus::Complete {
            self.publish(&final_state);
        }
        tracing::info!(
            session_id = %session_id,
            status = %final_state.status,
            steps = final_state.steps.len(),
            "analysis finished"
        );
        final_state
    }

    /// Persist a completed session and notify the feed.
    fn publish(&self, state: &AnalysisState) {
        let Some(session_id) = state.session_id.clone() else {
            return;
        };
        let analysis = CompletedAnalysis {
            session_id,
            question: state.question.clone(),
            years: state.years.clone(),
            dataset: state.dataset.clone(),
            plan: state.plan.as_ref().map(Plan::to_wire).unwrap_or_default(),
            steps: state.steps.clone(),
            summary: state.summary.clone().unwrap_or_default(),
            completed_at: Utc::now().timestamp_millis(),
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&analysis) {
                tracing::warn!(session_id = %analysis.session_id, error = %e, "failed to persist analysis");
            }
        }
        if let Some(feed) = &self.feed {
            feed.notify(FeedItem::from_analysis(&analysis));
        }
    }
}
