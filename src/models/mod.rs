//! Data Models
//!
//! Configuration structures. The analysis data model lives in
//! `deep-query-core`.

pub mod settings;

pub use settings::*;
