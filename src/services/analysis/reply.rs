//! Model Reply Boundary
//!
//! Turns the model's raw text into a closed set of replies. Everything the
//! model sends passes through here once; downstream code never inspects
//! optional JSON fields to guess what kind of reply it received.

use serde::Deserialize;

use deep_query_core::{strip_code_fences, ChartType, Complexity, PlanEntry};

use crate::utils::error::{AppError, AppResult};

/// A model reply, tagged by what it asks the executor to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    /// Step 0: the plan, no SQL.
    Plan {
        entries: Vec<PlanEntry>,
        reasoning: String,
        complexity: Complexity,
    },
    /// An execution step carrying one query.
    Execution {
        draft: StepDraft,
        reasoning: Option<String>,
        revised_plan: Option<Vec<PlanEntry>>,
        done: bool,
        summary: Option<String>,
    },
    /// The model declined to query for this step.
    CannotAnswer {
        title: Option<String>,
        explanation: String,
        done: bool,
        summary: Option<String>,
    },
    /// No further query; the run ends.
    Summary { summary: Option<String> },
}

/// Query proposed for an execution step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDraft {
    pub title: Option<String>,
    /// Fences already stripped; not yet validated
    pub sql: String,
    pub chart_type: ChartType,
    pub insight: String,
}

/// Replacement query from a repair call. Only the SQL is required.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairDraft {
    pub title: Option<String>,
    pub sql: String,
    pub chart_type: Option<ChartType>,
}

// ============================================================================
// Raw wire shape
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReply {
    #[serde(default)]
    plan: Option<Vec<RawPlanItem>>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    complexity: Option<String>,
    #[serde(default)]
    step: Option<RawStep>,
    #[serde(default)]
    revised_plan: Option<Vec<RawPlanItem>>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    cannot_answer: Option<String>,
    #[serde(default)]
    done: bool,
}

/// Plan items arrive either as objects or as `"title: purpose"` strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPlanItem {
    Text(String),
    Entry {
        #[serde(default, rename = "stepNumber")]
        step_number: Option<usize>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        purpose: Option<String>,
    },
}

impl RawPlanItem {
    fn into_entry(self, position: usize) -> PlanEntry {
        match self {
            RawPlanItem::Text(text) => PlanEntry::from_wire(&text),
            RawPlanItem::Entry {
                step_number,
                title,
                purpose,
            } => {
                let title = non_empty(title)
                    .unwrap_or_else(|| format!("Step {}", step_number.unwrap_or(position)));
                PlanEntry::new(title, purpose.unwrap_or_default().trim())
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    chart_type: Option<String>,
    #[serde(default)]
    insight: Option<String>,
    #[serde(default)]
    cannot_answer: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn plan_entries(items: Vec<RawPlanItem>, first_step: usize) -> Vec<PlanEntry> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| item.into_entry(first_step + i))
        .collect()
}

fn parse_complexity(value: Option<&str>) -> Complexity {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("simple") => Complexity::Simple,
        Some("complex") => Complexity::Complex,
        _ => Complexity::Moderate,
    }
}

/// Decode the reply JSON, tolerating a code fence or stray prose around it.
fn decode(text: &str) -> AppResult<RawReply> {
    let body = strip_code_fences(text);
    match serde_json::from_str(body) {
        Ok(raw) => Ok(raw),
        Err(first_err) => {
            let object = match (body.find('{'), body.rfind('}')) {
                (Some(start), Some(end)) if start < end => &body[start..=end],
                _ => return Err(AppError::model_response(first_err.to_string())),
            };
            serde_json::from_str(object).map_err(|e| AppError::model_response(e.to_string()))
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse the step 0 reply. Anything but a non-empty plan is a failure.
pub fn parse_plan_reply(text: &str) -> AppResult<ModelReply> {
    let raw = decode(text)?;
    let items = raw
        .plan
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError::model_response("planning reply has no plan"))?;
    Ok(ModelReply::Plan {
        entries: plan_entries(items, 1),
        reasoning: raw.reasoning.unwrap_or_default(),
        complexity: parse_complexity(raw.complexity.as_deref()),
    })
}

/// Parse the reply for execution step `step_index`.
pub fn parse_execution_reply(text: &str, step_index: usize) -> AppResult<ModelReply> {
    let raw = decode(text)?;
    let summary = non_empty(raw.summary);

    let Some(step) = raw.step else {
        if let Some(explanation) = non_empty(raw.cannot_answer) {
            return Ok(ModelReply::CannotAnswer {
                title: None,
                explanation,
                done: raw.done,
                summary,
            });
        }
        if raw.done {
            return Ok(ModelReply::Summary { summary });
        }
        return Err(AppError::model_response(
            "reply has neither a step nor done",
        ));
    };

    if let Some(explanation) = non_empty(step.cannot_answer) {
        return Ok(ModelReply::CannotAnswer {
            title: non_empty(step.title),
            explanation,
            done: raw.done,
            summary,
        });
    }

    let sql = step
        .sql
        .as_deref()
        .map(|s| strip_code_fences(s).to_string())
        .filter(|s| !s.is_empty());
    let Some(sql) = sql else {
        if raw.done {
            return Ok(ModelReply::Summary { summary });
        }
        return Err(AppError::model_response(
            "step has neither sql nor cannotAnswer",
        ));
    };

    let insight = non_empty(step.insight)
        .ok_or_else(|| AppError::model_response("step is missing insight"))?;

    Ok(ModelReply::Execution {
        draft: StepDraft {
            title: non_empty(step.title),
            sql,
            chart_type: step
                .chart_type
                .as_deref()
                .map(ChartType::from_hint)
                .unwrap_or_default(),
            insight,
        },
        reasoning: non_empty(raw.reasoning),
        revised_plan: raw
            .revised_plan
            .filter(|p| !p.is_empty())
            .map(|items| plan_entries(items, step_index + 1)),
        done: raw.done,
        summary,
    })
}

/// Parse a repair reply. `None` when it carries no usable query.
pub fn parse_repair_reply(text: &str) -> Option<RepairDraft> {
    let step = decode(text).ok()?.step?;
    let sql = step
        .sql
        .as_deref()
        .map(|s| strip_code_fences(s).to_string())
        .filter(|s| !s.is_empty())?;
    Some(RepairDraft {
        title: non_empty(step.title),
        sql,
        chart_type: step.chart_type.as_deref().map(ChartType::from_hint),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_objects_and_strings() {
        let reply = parse_plan_reply(
            r#"```json
{"plan":[{"stepNumber":1,"title":"Aggregate by state","purpose":"group total payments by state"},
         {"stepNumber":2,"purpose":"rank"}],
 "reasoning":"Sum then rank.","complexity":"moderate","stepIndex":0,"done":false}
```"#,
        )
        .unwrap();
        let ModelReply::Plan {
            entries,
            reasoning,
            complexity,
        } = reply
        else {
            panic!("expected plan");
        };
        assert_eq!(
            entries[0].to_wire(),
            "Aggregate by state: group total payments by state"
        );
        assert_eq!(entries[1].title, "Step 2");
        assert_eq!(reasoning, "Sum then rank.");
        assert_eq!(complexity, Complexity::Moderate);

        let reply = parse_plan_reply(r#"{"plan":["Rank: top five"],"complexity":"SIMPLE"}"#).unwrap();
        assert!(matches!(
            reply,
            ModelReply::Plan { complexity: Complexity::Simple, ref entries, .. } if entries[0].title == "Rank"
        ));
    }

    #[test]
    fn test_plan_reply_requires_plan() {
        assert!(matches!(
            parse_plan_reply(r#"{"step":{"sql":"SELECT 1"}}"#),
            Err(AppError::ModelResponse(_))
        ));
        assert!(matches!(
            parse_plan_reply("I think we should look at states."),
            Err(AppError::ModelResponse(_))
        ));
    }

    #[test]
    fn test_execution_reply() {
        let reply = parse_execution_reply(
            r#"Here you go: {"step":{"title":"Top states","sql":"```sql\nSELECT state FROM claims LIMIT 5\n```","chartType":"bar","insight":"CA leads"},
                "reasoning":"r","revisedPlan":[{"stepNumber":3,"title":"Drill","purpose":"by code"}],"done":false,"stepIndex":2}"#,
            2,
        )
        .unwrap();
        let ModelReply::Execution {
            draft,
            revised_plan,
            done,
            ..
        } = reply
        else {
            panic!("expected execution");
        };
        assert_eq!(draft.sql, "SELECT state FROM claims LIMIT 5");
        assert_eq!(draft.chart_type, ChartType::Bar);
        assert_eq!(draft.insight, "CA leads");
        assert_eq!(revised_plan.unwrap()[0].title, "Drill");
        assert!(!done);
    }

    #[test]
    fn test_execution_reply_requires_insight() {
        let err = parse_execution_reply(r#"{"step":{"sql":"SELECT 1"},"done":false}"#, 1).unwrap_err();
        assert!(err.to_string().contains("insight"));
    }

    #[test]
    fn test_cannot_answer_and_summary() {
        let reply = parse_execution_reply(
            r#"{"step":{"title":"Diagnoses","cannotAnswer":"No ICD codes in this dataset"},"done":false}"#,
            1,
        )
        .unwrap();
        assert!(matches!(
            reply,
            ModelReply::CannotAnswer { ref explanation, done: false, .. } if explanation == "No ICD codes in this dataset"
        ));

        let reply = parse_execution_reply(r#"{"done":true,"summary":"All done."}"#, 3).unwrap();
        assert_eq!(
            reply,
            ModelReply::Summary {
                summary: Some("All done.".into())
            }
        );

        let reply = parse_execution_reply(r#"{"done":true,"stepIndex":3}"#, 3).unwrap();
        assert_eq!(reply, ModelReply::Summary { summary: None });

        assert!(parse_execution_reply(r#"{"reasoning":"hmm"}"#, 1).is_err());
    }

    #[test]
    fn test_repair_reply() {
        let draft = parse_repair_reply(
            r#"{"step":{"title":"Fixed","sql":"SELECT state FROM claims LIMIT 5","chartType":"table"}}"#,
        )
        .unwrap();
        assert_eq!(draft.sql, "SELECT state FROM claims LIMIT 5");
        assert_eq!(draft.chart_type, Some(ChartType::Table));

        assert!(parse_repair_reply(r#"{"step":{"title":"No query"}}"#).is_none());
        assert!(parse_repair_reply("not json").is_none());
    }
}
