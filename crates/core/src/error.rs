//! Core Error Types
//!
//! The core crate performs no I/O, so its only failure is a step payload that
//! breaks the protocol's shape rules. The application crate wraps this in its
//! own error type.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A step response that no outcome variant can represent
    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
