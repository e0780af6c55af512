//! Scripted collaborators for integration tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use deep_query::models::settings::AppConfig;
use deep_query::services::analysis::{LocalStepClient, Orchestrator, StepExecutor};
use deep_query::storage::{AnalysisStore, CompletedAnalysis, FeedItem, FeedNotifier};
use deep_query::AppResult;
use deep_query_core::ResultSet;
use deep_query_llm::{Completion, CompletionRequest, LlmError, LlmProvider, LlmResult, Message};
use deep_query_remote::{QueryError, QueryExecutor, QueryResult};

/// Reply that never resolves.
pub const HANG: &str = "<hang>";

pub struct FakeModel {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl FakeModel {
    pub fn new(replies: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for FakeModel {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn model(&self) -> &str {
        "fake-model"
    }

    async fn complete(&self, request: CompletionRequest) -> LlmResult<Completion> {
        self.requests.lock().unwrap().push(request.messages);
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(text) if text == HANG => std::future::pending().await,
            Some(text) => Ok(Completion::from_text(text, "fake-model")),
            None => Err(LlmError::Server {
                status: 500,
                message: "no scripted reply left".into(),
            }),
        }
    }
}

pub struct FakeEngine {
    results: Mutex<VecDeque<QueryResult<ResultSet>>>,
    statements: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new(results: Vec<QueryResult<ResultSet>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            statements: Mutex::new(Vec::new()),
        })
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryExecutor for FakeEngine {
    async fn execute(
        &self,
        sql: &str,
        _dataset: Option<&str>,
        cancel: &CancellationToken,
    ) -> QueryResult<ResultSet> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        self.statements.lock().unwrap().push(sql.to_string());
        let next = self.results.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(ResultSet::default()))
    }
}

/// In-memory store and feed recording what the orchestrator publishes.
#[derive(Default)]
pub struct Recorder {
    pub saved: Mutex<Vec<CompletedAnalysis>>,
    pub feed: Mutex<Vec<FeedItem>>,
}

impl AnalysisStore for Recorder {
    fn save(&self, analysis: &CompletedAnalysis) -> AppResult<()> {
        self.saved.lock().unwrap().push(analysis.clone());
        Ok(())
    }

    fn load(&self, session_id: &str) -> AppResult<CompletedAnalysis> {
        self.saved
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.session_id == session_id)
            .cloned()
            .ok_or_else(|| deep_query::AppError::not_found(session_id))
    }

    fn list_recent(&self, limit: usize) -> AppResult<Vec<CompletedAnalysis>> {
        Ok(self.saved.lock().unwrap().iter().rev().take(limit).cloned().collect())
    }
}

impl FeedNotifier for Recorder {
    fn notify(&self, item: FeedItem) {
        self.feed.lock().unwrap().push(item);
    }
}

pub fn step_executor(model: Arc<FakeModel>, engine: Arc<FakeEngine>) -> Arc<StepExecutor> {
    Arc::new(StepExecutor::new(model, engine, Arc::new(AppConfig::default())))
}

/// Orchestrator running the step executor in-process, publishing to `recorder`.
pub fn local_orchestrator(
    model: Arc<FakeModel>,
    engine: Arc<FakeEngine>,
    recorder: Arc<Recorder>,
) -> Arc<Orchestrator> {
    orchestrator_over(step_executor(model, engine), recorder)
}

/// Like [`local_orchestrator`], with results narrated by `narrator`.
pub fn narrated_orchestrator(
    model: Arc<FakeModel>,
    narrator: Arc<FakeModel>,
    engine: Arc<FakeEngine>,
    recorder: Arc<Recorder>,
) -> Arc<Orchestrator> {
    let steps = StepExecutor::new(model, engine, Arc::new(AppConfig::default()))
        .with_narrator(narrator);
    orchestrator_over(Arc::new(steps), recorder)
}

fn orchestrator_over(steps: Arc<StepExecutor>, recorder: Arc<Recorder>) -> Arc<Orchestrator> {
    let client = Arc::new(LocalStepClient::new(steps));
    Arc::new(
        Orchestrator::new(client, AppConfig::default().analysis.max_steps)
            .with_store(recorder.clone())
            .with_feed(recorder),
    )
}

pub fn replies(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
