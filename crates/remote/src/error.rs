//! Remote query errors.

use thiserror::Error;

/// Failure kinds surfaced by the remote executor.
///
/// `Remote` carries the engine's own message verbatim so the caller can
/// classify it. `Timeout` is kept distinct because regenerating the query
/// does not help.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Query timed out after {seconds}s: the dataset is large and this query may need simplification.")]
    Timeout { seconds: u64 },

    #[error("{0}")]
    Remote(String),

    #[error("Query cancelled")]
    Cancelled,

    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("Query URL is not configured for dataset {0}")]
    NotConfigured(String),

    #[error("Query service unreachable: {0}")]
    Transport(String),

    #[error("Malformed query service response: {0}")]
    Decode(String),
}

pub type QueryResult<T> = Result<T, QueryError>;

impl QueryError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueryError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }
}
