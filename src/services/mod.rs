//! Services
//!
//! Business logic called by the HTTP handlers and the CLI.

pub mod analysis;
pub mod query_cache;
pub mod single_shot;

pub use analysis::{
    AnalysisRequest, AnalysisState, AnalysisStatus, HttpStepClient, LocalStepClient,
    Orchestrator, StepClient, StepExecutor,
};
pub use query_cache::{cache_key, normalize_question, CacheEntry, QueryCache};
pub use single_shot::{QueryRequest, QueryResponse, QueryService};
