//! Completed Analysis Store
//!
//! Persists finished deep analyses as one JSON document per session so they
//! can be listed, audited and used as context for follow-up questions.
//! Also defines the feed collaborator notified when an analysis completes.

use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use deep_query_core::{PriorAnalysis, PriorStep, Step};

use crate::utils::error::{AppError, AppResult};

/// Rows kept on the feed copy of the last step.
const FEED_ROW_LIMIT: usize = 200;

/// A finished deep analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedAnalysis {
    pub session_id: String,
    pub question: String,
    #[serde(default)]
    pub years: Option<Vec<i32>>,
    #[serde(default)]
    pub dataset: Option<String>,
    /// Final plan in `"title: purpose"` form
    #[serde(default)]
    pub plan: Vec<String>,
    pub steps: Vec<Step>,
    pub summary: String,
    pub completed_at: i64,
}

impl CompletedAnalysis {
    /// Context handed to the planner when the user asks a follow-up.
    pub fn as_prior(&self) -> PriorAnalysis {
        PriorAnalysis {
            question: self.question.clone(),
            summary: Some(self.summary.clone()),
            steps: self
                .steps
                .iter()
                .map(|s| PriorStep {
                    title: s.title.clone(),
                    insight: s.insight.clone(),
                })
                .collect(),
        }
    }
}

/// Storage for completed analyses.
pub trait AnalysisStore: Send + Sync {
    fn save(&self, analysis: &CompletedAnalysis) -> AppResult<()>;

    fn load(&self, session_id: &str) -> AppResult<CompletedAnalysis>;

    /// Most recent first.
    fn list_recent(&self, limit: usize) -> AppResult<Vec<CompletedAnalysis>>;
}

/// `AnalysisStore` writing `<base_dir>/<session_id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    base_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn path_for(&self, session_id: &str) -> AppResult<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(AppError::validation(format!(
                "Invalid session id: {}",
                session_id
            )));
        }
        Ok(self.base_dir.join(format!("{session_id}.json")))
    }
}

impl AnalysisStore for JsonFileStore {
    fn save(&self, analysis: &CompletedAnalysis) -> AppResult<()> {
        fs::create_dir_all(&self.base_dir)?;
        let path = self.path_for(&analysis.session_id)?;
        fs::write(&path, serde_json::to_string_pretty(analysis)?)?;
        tracing::debug!(session_id = %analysis.session_id, path = %path.display(), "analysis saved");
        Ok(())
    }

    fn load(&self, session_id: &str) -> AppResult<CompletedAnalysis> {
        let path = self.path_for(session_id)?;
        if !path.exists() {
            return Err(AppError::not_found(format!("analysis {}", session_id)));
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn list_recent(&self, limit: usize) -> AppResult<Vec<CompletedAnalysis>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut analyses = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(AppError::from)
                .and_then(|c| serde_json::from_str::<CompletedAnalysis>(&c).map_err(AppError::from))
            {
                Ok(analysis) => analyses.push(analysis),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable analysis"),
            }
        }
        analyses.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        analyses.truncate(limit);
        Ok(analyses)
    }
}

// ============================================================================
// Feed
// ============================================================================

/// Public feed entry for a completed analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: String,
    pub question: String,
    pub summary: String,
    pub step_count: usize,
    pub last_step: Option<Step>,
    pub timestamp: i64,
}

impl FeedItem {
    pub fn from_analysis(analysis: &CompletedAnalysis) -> Self {
        let last_step = analysis.steps.last().cloned().map(|mut step| {
            step.rows.truncate(FEED_ROW_LIMIT);
            step
        });
        Self {
            id: analysis.session_id.clone(),
            question: analysis.question.clone(),
            summary: analysis.summary.clone(),
            step_count: analysis.steps.len(),
            last_step,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Receives completed analyses. Failures stay inside the notifier.
pub trait FeedNotifier: Send + Sync {
    fn notify(&self, item: FeedItem);
}

/// Feed that only logs.
#[derive(Debug, Default, Clone)]
pub struct LogFeedNotifier;

impl FeedNotifier for LogFeedNotifier {
    fn notify(&self, item: FeedItem) {
        tracing::info!(
            session_id = %item.id,
            steps = item.step_count,
            "analysis published to feed"
        );
    }
}
