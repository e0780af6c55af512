//! Application State
//!
//! Wires configuration into the long-lived services shared by the server
//! and the CLI.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use deep_query_llm::{create_provider, LlmProvider, ProviderConfig};
use deep_query_remote::{HttpQueryExecutor, QueryExecutor};

use crate::models::settings::AppConfig;
use crate::services::analysis::StepExecutor;
use crate::services::single_shot::QueryService;
use crate::storage::{ConfigService, JsonFileStore};
use crate::utils::error::{AppError, AppResult};
use crate::utils::paths::analyses_dir;

/// Services built from one loaded configuration.
pub struct AppServices {
    pub config: Arc<AppConfig>,
    pub config_path: PathBuf,
    pub provider: Arc<dyn LlmProvider>,
    pub queries: Arc<dyn QueryExecutor>,
    pub steps: Arc<StepExecutor>,
    pub single_shot: Arc<QueryService>,
    pub store: Arc<JsonFileStore>,
}

impl AppServices {
    /// Load configuration from `config_path` (or the default location) and
    /// build every service from it.
    pub fn initialize(config_path: Option<PathBuf>) -> AppResult<Self> {
        let config_service = ConfigService::new(config_path)?;
        let config = Arc::new(config_service.get_config_clone());
        let provider = create_provider(config.llm.clone())?;
        let executor = HttpQueryExecutor::new(
            config.dataset_registry(),
            Duration::from_secs(config.query.timeout_secs),
        )
        .map_err(AppError::from)?;
        let queries: Arc<dyn QueryExecutor> = Arc::new(executor);

        tracing::info!(
            config = %config_service.config_path().display(),
            provider = provider.name(),
            model = provider.model(),
            datasets = config.datasets.len(),
            "services initialized"
        );

        let mut steps = StepExecutor::new(provider.clone(), queries.clone(), config.clone());
        if let Some(narrator) = narrative_provider(&config, &provider)? {
            steps = steps.with_narrator(narrator);
        }

        Ok(Self {
            steps: Arc::new(steps),
            single_shot: Arc::new(QueryService::new(
                provider.clone(),
                queries.clone(),
                config.clone(),
            )),
            store: Arc::new(analysis_store(&config)?),
            config_path: config_service.config_path().to_path_buf(),
            config,
            provider,
            queries,
        })
    }
}

/// Provider for post-execution narration: `None` when disabled, the main
/// provider unless `analysis.narrative_model` names another model.
pub fn narrative_provider(
    config: &AppConfig,
    main: &Arc<dyn LlmProvider>,
) -> AppResult<Option<Arc<dyn LlmProvider>>> {
    if !config.analysis.narrate_results {
        return Ok(None);
    }
    match &config.analysis.narrative_model {
        Some(model) if model != &config.llm.model => {
            let provider = create_provider(ProviderConfig {
                model: model.clone(),
                ..config.llm.clone()
            })?;
            Ok(Some(provider))
        }
        _ => Ok(Some(main.clone())),
    }
}

/// Store for completed analyses: `store_dir`, or `~/.deep-query/analyses`.
pub fn analysis_store(config: &AppConfig) -> AppResult<JsonFileStore> {
    let dir = match &config.store_dir {
        Some(dir) => dir.clone(),
        None => analyses_dir()?,
    };
    Ok(JsonFileStore::new(dir))
}
