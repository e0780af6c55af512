//! Step Protocol
//!
//! Request and response bodies exchanged once per step between the
//! orchestrator and the step executor. Responses are modelled as a closed
//! set of outcomes and converted to and from the flat camelCase wire shape
//! at the serde boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::model::{ChartType, Complexity, Plan, PlanEntry, PriorAnalysis, StepRecord};

// ============================================================================
// Request
// ============================================================================

/// One step-loop call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRequest {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub years: Option<Vec<i32>>,
    #[serde(default)]
    pub session_id: String,
    pub step_index: usize,
    #[serde(default)]
    pub previous_steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prior_analyses: Vec<PriorAnalysis>,
}

// ============================================================================
// Response
// ============================================================================

/// Result card for one execution step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub title: String,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub chart_type: ChartType,
    #[serde(default)]
    pub insight: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<Value>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Explanation when the model declined to query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cannot_answer: Option<String>,
}

/// What a single step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step 0 only.
    Plan {
        plan: Plan,
        reasoning: String,
        complexity: Complexity,
    },
    /// An executed step with more to come.
    Continue {
        step: StepResult,
        reasoning: Option<String>,
        revised_plan: Option<Plan>,
    },
    /// An executed step that ends the run.
    Finished { step: StepResult, summary: String },
    /// The run ends without a further query.
    Summary { summary: String },
    /// The model declined to write a query for this step.
    CannotAnswer {
        step: StepResult,
        done: bool,
        summary: Option<String>,
    },
}

impl StepOutcome {
    pub fn is_done(&self) -> bool {
        match self {
            StepOutcome::Plan { .. } | StepOutcome::Continue { .. } => false,
            StepOutcome::Finished { .. } | StepOutcome::Summary { .. } => true,
            StepOutcome::CannotAnswer { done, .. } => *done,
        }
    }

    pub fn step(&self) -> Option<&StepResult> {
        match self {
            StepOutcome::Continue { step, .. }
            | StepOutcome::Finished { step, .. }
            | StepOutcome::CannotAnswer { step, .. } => Some(step),
            StepOutcome::Plan { .. } | StepOutcome::Summary { .. } => None,
        }
    }

    pub fn summary(&self) -> Option<&str> {
        match self {
            StepOutcome::Finished { summary, .. } | StepOutcome::Summary { summary } => {
                Some(summary)
            }
            StepOutcome::CannotAnswer { summary, .. } => summary.as_deref(),
            _ => None,
        }
    }
}

/// Step-loop response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "StepResponseWire", try_from = "StepResponseWire")]
pub struct StepResponse {
    pub step_index: usize,
    pub outcome: StepOutcome,
}

impl StepResponse {
    pub fn new(step_index: usize, outcome: StepOutcome) -> Self {
        Self {
            step_index,
            outcome,
        }
    }

    pub fn is_done(&self) -> bool {
        self.outcome.is_done()
    }
}

/// Flat wire shape shared by every outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepResponseWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    plan: Option<Vec<String>>,
    /// Structured form of `plan`, preferred when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    plan_entries: Option<Vec<PlanEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    complexity: Option<Complexity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    step: Option<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revised_plan: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revised_plan_entries: Option<Vec<PlanEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    #[serde(default)]
    done: bool,
    step_index: usize,
}

impl From<StepResponse> for StepResponseWire {
    fn from(resp: StepResponse) -> Self {
        let mut wire = StepResponseWire {
            step_index: resp.step_index,
            ..Default::default()
        };
        match resp.outcome {
            StepOutcome::Plan {
                plan,
                reasoning,
                complexity,
            } => {
                wire.plan = Some(plan.to_wire());
                wire.plan_entries = Some(plan.entries);
                wire.reasoning = Some(reasoning);
                wire.complexity = Some(complexity);
            }
            StepOutcome::Continue {
                step,
                reasoning,
                revised_plan,
            } => {
                wire.step = Some(step);
                wire.reasoning = reasoning;
                if let Some(plan) = revised_plan {
                    wire.revised_plan = Some(plan.to_wire());
                    wire.revised_plan_entries = Some(plan.entries);
                }
            }
            StepOutcome::Finished { step, summary } => {
                wire.step = Some(step);
                wire.summary = Some(summary);
                wire.done = true;
            }
            StepOutcome::Summary { summary } => {
                wire.summary = Some(summary);
                wire.done = true;
            }
            StepOutcome::CannotAnswer {
                step,
                done,
                summary,
            } => {
                wire.step = Some(step);
                wire.summary = summary;
                wire.done = done;
            }
        }
        wire
    }
}

fn plan_from_wire(
    first_step: usize,
    entries: Option<Vec<PlanEntry>>,
    items: Option<Vec<String>>,
) -> Option<Plan> {
    match (entries, items) {
        (Some(entries), _) => Some(Plan {
            entries,
            first_step,
        }),
        (None, Some(items)) => Some(Plan::from_wire(first_step, &items)),
        (None, None) => None,
    }
}

impl TryFrom<StepResponseWire> for StepResponse {
    type Error = CoreError;

    fn try_from(wire: StepResponseWire) -> Result<Self, Self::Error> {
        let index = wire.step_index;

        let plan = plan_from_wire(1, wire.plan_entries, wire.plan);
        if let Some(plan) = plan {
            if index != 0 {
                return Err(CoreError::protocol(format!(
                    "plan returned for execution step {}",
                    index
                )));
            }
            return Ok(StepResponse::new(
                index,
                StepOutcome::Plan {
                    plan,
                    reasoning: wire.reasoning.unwrap_or_default(),
                    complexity: wire.complexity.unwrap_or_default(),
                },
            ));
        }

        let outcome = match (wire.step, wire.done) {
            (Some(step), done) if step.cannot_answer.is_some() => StepOutcome::CannotAnswer {
                step,
                done,
                summary: wire.summary,
            },
            (Some(step), true) => StepOutcome::Finished {
                step,
                summary: wire.summary.ok_or_else(|| {
                    CoreError::protocol(format!("terminal step {} has no summary", index))
                })?,
            },
            (Some(step), false) => StepOutcome::Continue {
                step,
                reasoning: wire.reasoning,
                revised_plan: plan_from_wire(
                    index + 1,
                    wire.revised_plan_entries,
                    wire.revised_plan,
                ),
            },
            (None, true) => StepOutcome::Summary {
                summary: wire.summary.ok_or_else(|| {
                    CoreError::protocol(format!("terminal step {} has no summary", index))
                })?,
            },
            (None, false) => {
                return Err(CoreError::protocol(format!(
                    "step {} response carries neither a plan, a step nor a summary",
                    index
                )))
            }
        };
        Ok(StepResponse::new(index, outcome))
    }
}
