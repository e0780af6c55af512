//! Scripted model and query fakes for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use deep_query_core::ResultSet;
use deep_query_llm::{Completion, CompletionRequest, LlmError, LlmProvider, LlmResult, Message};
use deep_query_remote::{QueryError, QueryExecutor, QueryResult};

/// Reply text that never resolves; used to hold a step in flight.
pub const HANG: &str = "<hang>";

/// Provider that replays canned replies in order.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(String::from).collect()),
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
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn complete(&self, request: CompletionRequest) -> LlmResult<Completion> {
        self.requests.lock().unwrap().push(request.messages);
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(text) if text == HANG => std::future::pending().await,
            Some(text) => Ok(Completion::from_text(text, "scripted-model")),
            None => Err(LlmError::Other("script exhausted".into())),
        }
    }
}

/// Query executor that replays canned results in order.
pub struct ScriptedExecutor {
    results: Mutex<VecDeque<QueryResult<ResultSet>>>,
    statements: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(results: Vec<QueryResult<ResultSet>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            statements: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.statements.lock().unwrap().len()
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
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
        next.unwrap_or_else(|| Err(QueryError::Remote("script exhausted".into())))
    }
}
