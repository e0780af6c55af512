//! Dataset endpoints.
//!
//! Each dataset is served by its own query service. The registry maps a
//! dataset key to the base URL and credential used to reach it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, QueryResult};

/// Connection parameters for one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetEndpoint {
    pub key: String,
    /// Base URL; requests go to `{query_url}/query`
    #[serde(default)]
    pub query_url: Option<String>,
    /// Sent as a bearer token when present
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl DatasetEndpoint {
    pub fn new(key: impl Into<String>, query_url: Option<String>) -> Self {
        Self {
            key: key.into(),
            query_url,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    /// Full endpoint for query execution.
    pub fn query_endpoint(&self) -> QueryResult<String> {
        let base = self
            .query_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| QueryError::NotConfigured(self.key.clone()))?;
        Ok(format!("{}/query", base.trim_end_matches('/')))
    }
}

/// Dataset key to endpoint lookup with a default.
#[derive(Debug, Clone, Default)]
pub struct DatasetRegistry {
    endpoints: HashMap<String, DatasetEndpoint>,
    default_key: Option<String>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint. The first registered dataset becomes the default.
    pub fn register(&mut self, endpoint: DatasetEndpoint) {
        if self.default_key.is_none() {
            self.default_key = Some(endpoint.key.clone());
        }
        self.endpoints.insert(endpoint.key.clone(), endpoint);
    }

    pub fn set_default(&mut self, key: impl Into<String>) {
        self.default_key = Some(key.into());
    }

    pub fn default_key(&self) -> Option<&str> {
        self.default_key.as_deref()
    }

    /// Resolve `key`, or the default dataset when `key` is `None`.
    pub fn resolve(&self, key: Option<&str>) -> QueryResult<&DatasetEndpoint> {
        let key = key
            .or(self.default_key.as_deref())
            .ok_or_else(|| QueryError::UnknownDataset("<none>".to_string()))?;
        self.endpoints
            .get(key)
            .ok_or_else(|| QueryError::UnknownDataset(key.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.endpoints.keys().map(String::as_str)
    }
}
