//! Deep Query - Rust Backend Library
//!
//! Natural-language questions over remote tabular datasets, answered either
//! by one generated query or by a planned multi-step deep analysis.
//! It includes:
//! - The deep-analysis step executor and orchestrator
//! - The single-shot query service and its response cache
//! - The axum HTTP surface
//! - Storage layer (JSON config, completed analyses)
//! - Configuration models and utilities

pub mod models;
pub mod server;
pub mod services;
pub mod state;
pub mod storage;
pub mod utils;

pub use models::settings::AppConfig;
pub use server::{build_router, AppState};
pub use state::AppServices;
pub use utils::error::{AppError, AppResult};
