//! Settings Models
//!
//! Application configuration: model provider, analysis limits, remote query
//! settings, response cache sizing and the dataset profiles that supply
//! schema text to prompts.

use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};

use deep_query_core::MAX_STEPS;
use deep_query_llm::{ProviderConfig, ProviderType};
use deep_query_remote::{DatasetEndpoint, DatasetRegistry};

/// Application configuration stored in config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model provider used for planning, step generation and repair
    #[serde(default)]
    pub llm: ProviderConfig,
    #[serde(default)]
    pub analysis: AnalysisSettings,
    #[serde(default)]
    pub query: QuerySettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub datasets: Vec<DatasetProfile>,
    /// Dataset used when a request names none; the first profile otherwise
    #[serde(default)]
    pub default_dataset: Option<String>,
    /// Directory for completed analyses (defaults to ~/.deep-query/analyses)
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

/// Limits applied to deep-analysis requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSettings {
    /// Model calls per run, the plan step included
    pub max_steps: usize,
    pub max_question_chars: usize,
    /// Inclusive range of selectable filter years
    pub min_year: i32,
    pub max_year: i32,
    /// Timeout for one step-loop call made by the orchestrator
    pub step_timeout_secs: u64,
    /// Rewrite step insights and final summaries from executed results
    #[serde(default = "default_true")]
    pub narrate_results: bool,
    /// Model for those rewrites; the main model when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative_model: Option<String>,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            max_steps: MAX_STEPS,
            max_question_chars: 500,
            min_year: 2018,
            max_year: 2024,
            step_timeout_secs: 120,
            narrate_results: true,
            narrative_model: None,
        }
    }
}

/// Remote query engine settings shared by every dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    pub timeout_secs: u64,
    /// Bearer token for datasets without their own key
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            timeout_secs: 90,
            api_key: None,
        }
    }
}

/// Single-shot response cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: 500,
            ttl_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Listen address for `serve`
    pub addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3000".to_string(),
        }
    }
}

/// A question pattern the dataset is known not to answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRule {
    /// Case-insensitive regular expression matched against the question
    pub pattern: String,
    /// Explanation returned to the user
    pub message: String,
}

/// Everything the prompts and the executor need to know about one dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetProfile {
    pub key: String,
    pub display_name: String,
    #[serde(default)]
    pub query_url: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Table and column descriptions, inserted into prompts verbatim
    #[serde(default)]
    pub schema_prompt: String,
    /// Analyst background notes, inserted into prompts verbatim
    #[serde(default)]
    pub domain_knowledge: String,
    /// Date column used for year filters; datasets without one ignore them
    #[serde(default)]
    pub date_column: Option<String>,
    #[serde(default)]
    pub scope_rules: Vec<ScopeRule>,
    #[serde(default = "default_true")]
    pub deep_analysis_supported: bool,
}

fn default_true() -> bool {
    true
}

impl DatasetProfile {
    /// First scope rule matching `question`, as its explanation.
    pub fn out_of_scope(&self, question: &str) -> Option<&str> {
        let question = question.trim();
        self.scope_rules
            .iter()
            .find(|rule| {
                Regex::new(&format!("(?i){}", rule.pattern))
                    .map(|re| re.is_match(question))
                    .unwrap_or(false)
            })
            .map(|rule| rule.message.as_str())
    }

    fn endpoint(&self, fallback_key: Option<&String>) -> DatasetEndpoint {
        DatasetEndpoint::new(self.key.clone(), self.query_url.clone())
            .with_api_key(self.api_key.clone().or_else(|| fallback_key.cloned()))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: ProviderConfig::default(),
            analysis: AnalysisSettings::default(),
            query: QuerySettings::default(),
            cache: CacheSettings::default(),
            server: ServerSettings::default(),
            datasets: vec![default_medicaid_profile()],
            default_dataset: None,
            store_dir: None,
        }
    }
}

fn default_medicaid_profile() -> DatasetProfile {
    DatasetProfile {
        key: "medicaid".to_string(),
        display_name: "Medicaid provider spending".to_string(),
        query_url: None,
        api_key: None,
        schema_prompt: "Table claims(billing_npi VARCHAR, hcpcs_code VARCHAR, claim_month DATE, \
                        state VARCHAR, total_paid DOUBLE, total_claims BIGINT, beneficiaries BIGINT). \
                        Table hcpcs_lookup(hcpcs_code VARCHAR, description VARCHAR). \
                        Table npi_lookup(npi VARCHAR, provider_name VARCHAR, provider_type VARCHAR, state VARCHAR)."
            .to_string(),
        domain_knowledge: "- Spending is highly concentrated: a small number of providers and procedures account for most dollars\n\
                           - Oct-Dec 2024 data is incomplete; truncate monthly trends at Sept 2024\n\
                           - Beneficiary counts cannot be summed across HCPCS codes or providers because beneficiaries overlap"
            .to_string(),
        date_column: Some("claim_month".to_string()),
        scope_rules: vec![
            ScopeRule {
                pattern: r"\b(diagnos[ei]s|icd[- ]?10|icd[- ]?9|diagnostic code|disease code)\b".to_string(),
                message: "This dataset does not contain diagnosis or ICD codes. It only has HCPCS/CPT procedure codes, so questions about specific diagnoses cannot be answered.".to_string(),
            },
            ScopeRule {
                pattern: r"\b(patient age|patient gender|patient race|patient ethnicit|patient demographic)".to_string(),
                message: "This dataset does not contain patient demographics. It only tracks provider billing data: NPI, procedure code, payment amounts and claim counts.".to_string(),
            },
            ScopeRule {
                pattern: r"\b(mortality|death rate|survival rate|readmission rate|clinical outcome)\b".to_string(),
                message: "This dataset does not contain clinical outcomes. It only tracks what was billed, how much was paid and how many claims were filed.".to_string(),
            },
        ],
        deep_analysis_supported: true,
    }
}

impl AppConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        let analysis = &self.analysis;
        if analysis.max_steps < 2 || analysis.max_steps > MAX_STEPS {
            return Err(format!(
                "analysis.max_steps must be between 2 and {}",
                MAX_STEPS
            ));
        }
        if analysis.max_question_chars == 0 {
            return Err("analysis.max_question_chars must be positive".to_string());
        }
        if analysis.min_year > analysis.max_year {
            return Err(format!(
                "Invalid year range: {} > {}",
                analysis.min_year, analysis.max_year
            ));
        }
        if analysis.step_timeout_secs == 0 || self.query.timeout_secs == 0 {
            return Err("Timeouts must be at least 1 second".to_string());
        }

        if !(0.0..=1.0).contains(&self.llm.temperature) {
            return Err(format!(
                "Invalid temperature: {}. Must be between 0.0 and 1.0",
                self.llm.temperature
            ));
        }

        if self.cache.capacity == 0 {
            return Err("cache.capacity must be positive".to_string());
        }
        if self.cache.ttl_secs == 0 {
            return Err("cache.ttl_secs must be positive".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for dataset in &self.datasets {
            if dataset.key.trim().is_empty() {
                return Err("Dataset key cannot be empty".to_string());
            }
            if !seen.insert(dataset.key.as_str()) {
                return Err(format!("Duplicate dataset key: {}", dataset.key));
            }
            for rule in &dataset.scope_rules {
                Regex::new(&rule.pattern).map_err(|e| {
                    format!("Invalid scope rule for {}: {}", dataset.key, e)
                })?;
            }
        }

        if let Some(default) = &self.default_dataset {
            if !seen.contains(default.as_str()) {
                return Err(format!("Unknown default dataset: {}", default));
            }
        }

        Ok(())
    }

    /// Overlay credentials and endpoints from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_with(|name| std::env::var(name).ok().filter(|v| !v.is_empty()));
    }

    /// Overlay values from `lookup`; used directly by tests.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let key_var = match self.llm.provider {
            ProviderType::Anthropic => "ANTHROPIC_API_KEY",
            ProviderType::OpenAI => "OPENAI_API_KEY",
        };
        if let Some(key) = lookup(key_var) {
            self.llm.api_key = Some(key);
        }
        if let Some(key) = lookup("QUERY_SERVICE_API_KEY") {
            self.query.api_key = Some(key);
        }
        for dataset in &mut self.datasets {
            let var = format!("DEEP_QUERY_{}_URL", dataset.key.to_ascii_uppercase());
            if let Some(url) = lookup(&var) {
                dataset.query_url = Some(url);
            }
        }
    }

    /// Key of the dataset used when a request names none.
    pub fn default_dataset_key(&self) -> Option<&str> {
        self.default_dataset
            .as_deref()
            .or_else(|| self.datasets.first().map(|d| d.key.as_str()))
    }

    /// Look up a dataset profile, falling back to the default.
    pub fn dataset(&self, key: Option<&str>) -> Option<&DatasetProfile> {
        let key = key.or_else(|| self.default_dataset_key())?;
        self.datasets.iter().find(|d| d.key == key)
    }

    /// Endpoint registry for the remote query executor.
    pub fn dataset_registry(&self) -> DatasetRegistry {
        let mut registry = DatasetRegistry::new();
        for dataset in &self.datasets {
            registry.register(dataset.endpoint(self.query.api_key.as_ref()));
        }
        if let Some(key) = self.default_dataset_key() {
            registry.set_default(key);
        }
        registry
    }

    /// Keep only years inside the configured range, sorted and deduplicated.
    /// An empty or absent selection means no filter.
    pub fn filter_years(&self, years: Option<&[i32]>) -> Option<Vec<i32>> {
        let mut kept: Vec<i32> = years?
            .iter()
            .copied()
            .filter(|y| (self.analysis.min_year..=self.analysis.max_year).contains(y))
            .collect();
        kept.sort_unstable();
        kept.dedup();
        if kept.is_empty() {
            None
        } else {
            Some(kept)
        }
    }

    /// Copy with secrets removed, for display.
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        if copy.llm.api_key.is_some() {
            copy.llm.api_key = Some("********".to_string());
        }
        copy
    }
}
