//! Deep Analysis Service
//!
//! Multi-step question answering over a remote dataset:
//! - Prompt construction for the plan step and each execution step
//! - Tagged parsing of model replies
//! - Stateless step execution with SQL gating and a single repair
//! - Insights and summaries rewritten from executed results
//! - Step clients (in-process and HTTP)
//! - The orchestrator state machine that drives a session

pub mod client;
pub mod narrator;
pub mod orchestrator;
pub mod prompts;
pub mod reply;
pub mod step_executor;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{HttpStepClient, LocalStepClient, StepClient, STEP_REQUEST_TIMEOUT};
pub use narrator::Narrator;
pub use orchestrator::{
    AnalysisEvent, AnalysisRequest, AnalysisState, AnalysisStatus, Orchestrator,
    BUDGET_EXHAUSTED_SUMMARY,
};
pub use prompts::{build_single_shot_prompt, build_step_prompt, PromptInput, StepPrompt};
pub use reply::ModelReply;
pub use step_executor::{is_fixable, RepairAttempt, StepExecutor};
