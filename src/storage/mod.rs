//! Storage Layer
//!
//! JSON config and completed-analysis persistence.

pub mod analysis_store;
pub mod config;

pub use analysis_store::*;
pub use config::*;
