//! Deep Query Core
//!
//! Data model, step protocol and pure analysis helpers shared by the
//! deep-query workspace. This crate performs no I/O.
//!
//! ## Module Organization
//!
//! - `error` - Core error types (`CoreError`, `CoreResult`)
//! - `model` - Plans, steps, result sets and the completed-step ledger
//! - `protocol` - Step-loop request/response bodies
//! - `sql_guard` - Lexical SQL safety gate and code-fence stripping
//! - `chart` - Chart-type inference for single-shot answers
//! - `summarize` - Result-set summaries fed back into prompts

pub mod chart;
pub mod error;
pub mod model;
pub mod protocol;
pub mod sql_guard;
pub mod summarize;

// ── Error Types ────────────────────────────────────────────────────────
pub use error::{CoreError, CoreResult};

// ── Data Model ─────────────────────────────────────────────────────────
pub use model::{
    ChartType, Complexity, Plan, PlanEntry, PriorAnalysis, PriorStep, ResultSet, Step,
    StepRecord, StepStatus, MAX_RESULT_ROWS, MAX_STEPS,
};

// ── Step Protocol ──────────────────────────────────────────────────────
pub use protocol::{StepOutcome, StepRequest, StepResponse, StepResult};

// ── Pure Helpers ───────────────────────────────────────────────────────
pub use chart::infer_chart_type;
pub use sql_guard::{strip_code_fences, validate_sql, SqlRejection};
pub use summarize::summarize_results;
