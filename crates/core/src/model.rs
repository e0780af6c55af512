//! Analysis Data Model
//!
//! Plans, steps, result sets and the append-only ledger of completed steps
//! that is replayed into later prompts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on model calls per deep analysis, the plan step included.
pub const MAX_STEPS: usize = 5;

/// Row cap injected into any query that lacks its own `LIMIT`.
pub const MAX_RESULT_ROWS: usize = 10_000;

// ============================================================================
// Chart & Complexity Hints
// ============================================================================

/// Rendering hint attached to a step's result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    #[default]
    Table,
    Line,
    Bar,
    Pie,
}

impl ChartType {
    /// Parse a model-supplied hint. Anything unrecognised renders as a table.
    pub fn from_hint(hint: &str) -> Self {
        match hint.trim().to_ascii_lowercase().as_str() {
            "line" => ChartType::Line,
            "bar" => ChartType::Bar,
            "pie" => ChartType::Pie,
            _ => ChartType::Table,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChartType::Table => "table",
            ChartType::Line => "line",
            ChartType::Bar => "bar",
            ChartType::Pie => "pie",
        }
    }
}

impl std::fmt::Display for ChartType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How involved the model judged the question to be at planning time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Moderate => write!(f, "moderate"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

// ============================================================================
// Plan
// ============================================================================

/// One planned unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub title: String,
    #[serde(default)]
    pub purpose: String,
}

impl PlanEntry {
    pub fn new(title: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            purpose: purpose.into(),
        }
    }

    /// Parse the `"title: purpose"` display form, splitting at the first
    /// separator. A string without one becomes a title with an empty
    /// purpose. Lossy when the title itself contains `": "`; step responses
    /// carry structured entries alongside for that reason.
    pub fn from_wire(text: &str) -> Self {
        match text.split_once(": ") {
            Some((title, purpose)) => Self::new(title.trim(), purpose.trim()),
            None => Self::new(text.trim(), ""),
        }
    }

    pub fn to_wire(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for PlanEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.purpose.is_empty() {
            write!(f, "{}", self.title)
        } else {
            write!(f, "{}: {}", self.title, self.purpose)
        }
    }
}

/// Ordered plan entries anchored at the execution step the first entry
/// describes.
///
/// The step 0 plan is anchored at step 1. A revision returned with step `i`
/// describes the remaining work and is anchored at step `i + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
    pub first_step: usize,
}

impl Plan {
    pub fn initial(entries: Vec<PlanEntry>) -> Self {
        Self {
            entries,
            first_step: 1,
        }
    }

    pub fn revised_at(step_index: usize, entries: Vec<PlanEntry>) -> Self {
        Self {
            entries,
            first_step: step_index + 1,
        }
    }

    pub fn from_wire(first_step: usize, items: &[String]) -> Self {
        Self {
            entries: items.iter().map(|s| PlanEntry::from_wire(s)).collect(),
            first_step,
        }
    }

    pub fn to_wire(&self) -> Vec<String> {
        self.entries.iter().map(PlanEntry::to_wire).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry describing execution step `step_index`, if the plan covers it.
    pub fn entry_for_step(&self, step_index: usize) -> Option<&PlanEntry> {
        step_index
            .checked_sub(self.first_step)
            .and_then(|offset| self.entries.get(offset))
    }

    /// Placeholder title for execution step `step_index`.
    pub fn title_for_step(&self, step_index: usize) -> String {
        self.entry_for_step(step_index)
            .map(|e| e.title.clone())
            .unwrap_or_else(|| format!("Step {}", step_index))
    }

    /// Numbered listing used in prompts and plan ledger entries.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| format!("{}. {}", self.first_step + i, e))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ============================================================================
// Steps & Results
// ============================================================================

/// Lifecycle of a visible step card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Generating,
    Executing,
    Complete,
    Error,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Complete | StepStatus::Error)
    }
}

/// Columns and rows returned by the remote engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Values of column `idx` across all rows; short rows yield `Null`.
    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &Value> + '_ {
        self.rows
            .iter()
            .map(move |row| row.get(idx).unwrap_or(&Value::Null))
    }
}

/// One visible step of a deep analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// 1-based execution index
    pub index: usize,
    pub title: String,
    pub sql: Option<String>,
    pub chart_type: ChartType,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub insight: Option<String>,
    pub error: Option<String>,
    pub status: StepStatus,
}

impl Step {
    /// Card shown while the step's model call is in flight.
    pub fn placeholder(index: usize, title: impl Into<String>) -> Self {
        Self {
            index,
            title: title.into(),
            sql: None,
            chart_type: ChartType::Table,
            columns: Vec::new(),
            rows: Vec::new(),
            insight: None,
            error: None,
            status: StepStatus::Generating,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Server-trusted projection of a finished step, replayed into later prompts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step_index: usize,
    pub title: String,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub result_summary: Option<String>,
    #[serde(default)]
    pub insight: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A completed analysis the user is following up on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorAnalysis {
    pub question: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub steps: Vec<PriorStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorStep {
    pub title: String,
    #[serde(default)]
    pub insight: Option<String>,
}
