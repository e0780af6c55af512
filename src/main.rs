// Deep Query - CLI and HTTP server entry point

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use deep_query::services::analysis::{
    AnalysisRequest, AnalysisState, AnalysisStatus, HttpStepClient, LocalStepClient, Orchestrator,
    StepClient,
};
use deep_query::services::single_shot::QueryRequest;
use deep_query::state::analysis_store;
use deep_query::storage::{AnalysisStore, ConfigService, LogFeedNotifier};
use deep_query::{build_router, AppServices, AppState};

#[derive(Parser)]
#[command(name = "deep-query")]
#[command(about = "Natural-language questions over remote tabular datasets", long_about = None)]
struct Cli {
    /// Config file (default: ~/.deep-query/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Listen address (overrides config)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Run a multi-step deep analysis
    Analyze {
        question: String,
        /// Year filter, e.g. 2022,2023
        #[arg(long, value_delimiter = ',')]
        years: Vec<i32>,
        #[arg(long)]
        dataset: Option<String>,
        /// Drive the steps through a running server instead of in-process
        #[arg(long)]
        server: Option<String>,
        /// Session id of a saved analysis this question follows up on
        #[arg(long)]
        follow_up: Option<String>,
    },
    /// Answer with a single generated query
    Ask {
        question: String,
        #[arg(long, value_delimiter = ',')]
        years: Vec<i32>,
        #[arg(long)]
        dataset: Option<String>,
    },
    /// List saved analyses
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print the effective configuration (secrets redacted)
    Config,
}

fn years_arg(years: Vec<i32>) -> Option<Vec<i32>> {
    (!years.is_empty()).then_some(years)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deep_query=info,tower_http=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { addr } => serve(cli.config, addr).await,
        Commands::Analyze {
            question,
            years,
            dataset,
            server,
            follow_up,
        } => {
            let request = AnalysisRequest {
                question,
                years: years_arg(years),
                dataset,
                prior_analyses: Vec::new(),
            };
            analyze(cli.config, request, server, follow_up).await
        }
        Commands::Ask {
            question,
            years,
            dataset,
        } => ask(cli.config, question, years_arg(years), dataset).await,
        Commands::History { limit } => history(cli.config, limit),
        Commands::Config => {
            let service = ConfigService::new(cli.config)?;
            let redacted = service.get_config().redacted();
            println!("# {}", service.config_path().display());
            println!("{}", serde_json::to_string_pretty(&redacted)?);
            Ok(())
        }
    }
}

async fn serve(config: Option<PathBuf>, addr: Option<String>) -> Result<()> {
    let services = AppServices::initialize(config)?;
    let addr = addr.unwrap_or_else(|| services.config.server.addr.clone());
    let state = Arc::new(AppState::new(services.steps.clone(), services.single_shot.clone()));
    let shutdown = state.shutdown.clone();

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(addr = %addr, "deep-query server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            shutdown.cancel();
        })
        .await?;
    Ok(())
}

async fn analyze(
    config: Option<PathBuf>,
    mut request: AnalysisRequest,
    server: Option<String>,
    follow_up: Option<String>,
) -> Result<()> {
    let (client, app_config) = match server {
        Some(url) => {
            let app_config = ConfigService::new(config)?.get_config_clone();
            let timeout = Duration::from_secs(app_config.analysis.step_timeout_secs);
            let client: Arc<dyn StepClient> = Arc::new(HttpStepClient::new(&url, timeout)?);
            (client, app_config)
        }
        None => {
            let services = AppServices::initialize(config)?;
            let client: Arc<dyn StepClient> =
                Arc::new(LocalStepClient::new(services.steps.clone()));
            (client, (*services.config).clone())
        }
    };
    let store = Arc::new(analysis_store(&app_config)?);

    if let Some(session_id) = follow_up {
        let prior = store.load(&session_id)?;
        request.prior_analyses.push(prior.as_prior());
    }

    let orchestrator = Arc::new(
        Orchestrator::new(client, app_config.analysis.max_steps)
            .with_store(store)
            .with_feed(Arc::new(LogFeedNotifier)),
    );
    let renderer = tokio::spawn(render(orchestrator.subscribe()));

    let cancel_on_ctrl_c = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                orchestrator.cancel();
            }
        })
    };

    let state = orchestrator.run(request).await;
    cancel_on_ctrl_c.abort();
    let _ = renderer.await;

    match state.status {
        AnalysisStatus::Complete => {
            println!("\n== Summary ==\n{}", state.summary.unwrap_or_default());
            if let Some(id) = state.session_id {
                println!("\n(session {})", id);
            }
            Ok(())
        }
        AnalysisStatus::Cancelled => {
            println!("\nAnalysis cancelled.");
            Ok(())
        }
        _ => anyhow::bail!(state.error.unwrap_or_else(|| "analysis failed".into())),
    }
}

/// Print the plan and each finished card as the state changes.
async fn render(mut rx: watch::Receiver<AnalysisState>) {
    let mut plan_printed = false;
    let mut cards_printed = 0;
    let mut announced = 0;

    while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update().clone();

        if !plan_printed {
            if let Some(plan) = &state.plan {
                println!("== Plan ==\n{}\n", plan.render());
                plan_printed = true;
            }
        }
        for step in state.steps.iter() {
            if step.is_placeholder() && step.index > announced {
                println!("-- Step {}: {} ...", step.index, step.title);
                announced = step.index;
            }
        }
        let finished: Vec<_> = state.steps.iter().filter(|s| !s.is_placeholder()).collect();
        for step in finished.iter().skip(cards_printed) {
            println!("== Step {}: {} ==", step.index, step.title);
            if let Some(sql) = &step.sql {
                println!("{}", sql);
            }
            match &step.error {
                Some(error) => println!("error: {}", error),
                None if step.sql.is_some() => println!("{} row(s) [{}]", step.rows.len(), step.chart_type),
                None => {}
            }
            if let Some(insight) = &step.insight {
                println!("{}", insight);
            }
            println!();
        }
        cards_printed = finished.len();

        if state.status.is_terminal() {
            break;
        }
    }
}

async fn ask(
    config: Option<PathBuf>,
    question: String,
    years: Option<Vec<i32>>,
    dataset: Option<String>,
) -> Result<()> {
    let services = AppServices::initialize(config)?;
    let request = QueryRequest {
        question,
        years,
        dataset,
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let answer = tokio::select! {
        res = services.single_shot.ask(&request, &cancel) => res?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            anyhow::bail!("cancelled");
        }
    };
    println!("{}\n", answer.sql);
    println!("{}", answer.columns.join("\t"));
    for row in &answer.rows {
        let cells: Vec<String> = row
            .iter()
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        println!("{}", cells.join("\t"));
    }
    println!("\n{} row(s), chart: {}", answer.rows.len(), answer.chart_type);
    Ok(())
}

fn history(config: Option<PathBuf>, limit: usize) -> Result<()> {
    let service = ConfigService::new(config)?;
    let store = analysis_store(service.get_config())?;
    for analysis in store.list_recent(limit)? {
        let when = chrono::DateTime::from_timestamp_millis(analysis.completed_at)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{}  {}  {} ({} steps)",
            analysis.session_id,
            when,
            analysis.question,
            analysis.steps.len()
        );
    }
    Ok(())
}
