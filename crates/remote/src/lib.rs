//! Deep Query Remote
//!
//! Client side of the remote tabular query engine:
//!
//! - `executor` - `QueryExecutor` trait and its HTTP implementation
//! - `dataset` - Dataset endpoint registry
//! - `error` - `QueryError` failure kinds

pub mod dataset;
pub mod error;
pub mod executor;

pub use dataset::{DatasetEndpoint, DatasetRegistry};
pub use error::{QueryError, QueryResult};
pub use executor::{apply_row_cap, HttpQueryExecutor, QueryExecutor, DEFAULT_QUERY_TIMEOUT};
