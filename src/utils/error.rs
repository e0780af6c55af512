//! Error Handling
//!
//! Unified error types for the application.
//! Uses thiserror for ergonomic error definitions; the HTTP surface maps each
//! variant to a status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use deep_query_core::{CoreError, SqlRejection};
use deep_query_llm::LlmError;
use deep_query_remote::QueryError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Request validation errors
    #[error("{0}")]
    Validation(String),

    /// Model-authored SQL refused by the safety gate
    #[error("{0}")]
    SqlRejected(#[from] SqlRejection),

    /// The question is outside what the dataset can answer
    #[error("{0}")]
    CannotAnswer(String),

    /// The model replied, but not in the agreed structure
    #[error("Failed to parse analysis response: {0}")]
    ModelResponse(String),

    /// The model call itself failed
    #[error("Model error: {0}")]
    Llm(#[from] LlmError),

    /// The remote engine failed outside of a step
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Step protocol violations
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The caller cancelled the run
    #[error("Analysis cancelled")]
    Cancelled,

    /// Error reported by a remote step endpoint
    #[error("{message}")]
    Upstream { status: u16, message: String },

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a model response error
    pub fn model_response(msg: impl Into<String>) -> Self {
        Self::ModelResponse(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled | AppError::Query(QueryError::Cancelled))
    }

    /// HTTP status reported for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::SqlRejected(_) => StatusCode::BAD_REQUEST,
            AppError::CannotAnswer(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Cancelled | AppError::Query(QueryError::Cancelled) => {
                // Client closed request
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            AppError::Llm(LlmError::Timeout { .. })
            | AppError::Query(QueryError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::ModelResponse(_) | AppError::Llm(_) | AppError::Query(_) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::Config(_)
            | AppError::Io(_)
            | AppError::Serialization(_)
            | AppError::Core(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convert AppError to a string for CLI output
impl From<AppError> for String {
    fn from(err: AppError) -> String {
        err.to_string()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        let body = match &self {
            AppError::CannotAnswer(message) => {
                serde_json::json!({ "error": message, "cannotAnswer": true })
            }
            other => serde_json::json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}
