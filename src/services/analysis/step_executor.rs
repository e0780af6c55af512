//! Step Executor
//!
//! Runs one step of a deep analysis: builds the prompt, calls the model,
//! parses its reply, gates any SQL, executes it remotely and, for fixable
//! SQL errors, makes exactly one repair attempt. With a narrator attached,
//! insights and summaries are rewritten from the actual results. Holds no
//! per-session state.

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use regex::Regex;
use tokio_util::sync::CancellationToken;

use deep_query_core::{
    summarize_results, validate_sql, Plan, ResultSet, StepOutcome, StepRecord,
    StepRequest, StepResponse, StepResult,
};
use deep_query_llm::{CompletionRequest, LlmProvider, Message};
use deep_query_remote::{QueryError, QueryExecutor};

use crate::models::settings::{AppConfig, DatasetProfile};
use crate::utils::error::{AppError, AppResult};

use super::narrator::Narrator;
use super::prompts::{build_step_prompt, PromptInput, StepPrompt};
use super::reply::{
    parse_execution_reply, parse_plan_reply, parse_repair_reply, ModelReply, RepairDraft,
};

/// Which execution of a step's query is running. A step gets at most one
/// repair, so there is no state after `Repair`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAttempt {
    Initial,
    Repair,
}

impl RepairAttempt {
    pub fn next(self) -> Option<Self> {
        match self {
            RepairAttempt::Initial => Some(RepairAttempt::Repair),
            RepairAttempt::Repair => None,
        }
    }
}

fn fixable_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)binder error|parser error|catalog error|not implemented|no such|not found|does not have",
        )
        .expect("valid pattern")
    })
}

/// Whether regenerating the query could fix `err`.
pub fn is_fixable(err: &QueryError) -> bool {
    match err {
        QueryError::Remote(message) => fixable_pattern().is_match(message),
        _ => false,
    }
}

/// Summary used when a run ends without one from the model.
pub fn synthesize_summary(question: &str, records: &[StepRecord]) -> String {
    let findings: Vec<String> = records
        .iter()
        .filter(|r| r.step_index > 0)
        .filter_map(|r| r.insight.as_ref().map(|i| format!("- {}: {}", r.title, i)))
        .collect();
    if findings.is_empty() {
        format!(
            "The analysis of \"{}\" finished without producing results.",
            question
        )
    } else {
        format!(
            "Findings for \"{}\":\n{}",
            question,
            findings.join("\n")
        )
    }
}

/// Request after validation, with its dataset resolved.
struct ValidatedStep<'a> {
    request: &'a StepRequest,
    dataset: &'a DatasetProfile,
    years: Option<Vec<i32>>,
}

impl ValidatedStep<'_> {
    fn prompt_input(&self, max_steps: usize) -> PromptInput<'_> {
        PromptInput {
            question: self.request.question.trim(),
            step_index: self.request.step_index,
            max_steps,
            previous_steps: &self.request.previous_steps,
            years: self.years.as_deref(),
            dataset: self.dataset,
            prior_analyses: &self.request.prior_analyses,
        }
    }
}

/// Stateless executor for step-loop requests.
pub struct StepExecutor {
    provider: Arc<dyn LlmProvider>,
    queries: Arc<dyn QueryExecutor>,
    config: Arc<AppConfig>,
    narrator: Option<Narrator>,
}

impl StepExecutor {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        queries: Arc<dyn QueryExecutor>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            provider,
            queries,
            config,
            narrator: None,
        }
    }

    /// Ground insights and final summaries in executed results using
    /// `provider`.
    pub fn with_narrator(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.narrator = Some(Narrator::new(provider));
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Run step `request.step_index`.
    ///
    /// Validation failures, SQL rejections, model failures and cancellation
    /// are errors. Query failures are attached to the returned step.
    pub async fn run_step(
        &self,
        request: &StepRequest,
        cancel: &CancellationToken,
    ) -> AppResult<StepResponse> {
        let started = Instant::now();
        let step = self.validate(request)?;

        let outcome = if request.step_index == 0 {
            self.run_planning(&step, cancel).await?
        } else {
            self.run_execution(&step, cancel).await?
        };

        tracing::info!(
            session_id = %request.session_id,
            step_index = request.step_index,
            dataset = %step.dataset.key,
            done = outcome.is_done(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analysis step finished"
        );
        Ok(StepResponse::new(request.step_index, outcome))
    }

    fn validate<'a>(&'a self, request: &'a StepRequest) -> AppResult<ValidatedStep<'a>> {
        let limits = &self.config.analysis;
        if request.question.chars().count() > limits.max_question_chars {
            return Err(AppError::validation(format!(
                "Question must be under {} characters.",
                limits.max_question_chars
            )));
        }
        if request.question.trim().is_empty() {
            return Err(AppError::validation("Question cannot be empty."));
        }
        if request.session_id.trim().is_empty() {
            return Err(AppError::validation("sessionId is required."));
        }
        if request.step_index >= limits.max_steps {
            return Err(AppError::validation(format!(
                "stepIndex must be 0-{}.",
                limits.max_steps - 1
            )));
        }
        let ordered = request
            .previous_steps
            .windows(2)
            .all(|w| w[0].step_index < w[1].step_index)
            && request
                .previous_steps
                .last()
                .map_or(true, |r| r.step_index < request.step_index);
        if !ordered {
            return Err(AppError::validation(
                "previousSteps must be in increasing step order before stepIndex.",
            ));
        }

        let dataset = self.config.dataset(request.dataset.as_deref()).ok_or_else(|| {
            AppError::validation(format!(
                "Unknown dataset: {}",
                request.dataset.as_deref().unwrap_or("<default>")
            ))
        })?;
        if !dataset.deep_analysis_supported {
            return Err(AppError::validation(format!(
                "Deep analysis is not available for {}.",
                dataset.display_name
            )));
        }

        if request.step_index == 0 {
            if let Some(message) = dataset.out_of_scope(&request.question) {
                return Err(AppError::CannotAnswer(message.to_string()));
            }
        }

        Ok(ValidatedStep {
            request,
            dataset,
            years: self.config.filter_years(request.years.as_deref()),
        })
    }

    async fn run_planning(
        &self,
        step: &ValidatedStep<'_>,
        cancel: &CancellationToken,
    ) -> AppResult<StepOutcome> {
        let prompt = build_step_prompt(&step.prompt_input(self.config.analysis.max_steps));
        let text = self.call_model(&prompt.system, prompt.messages, cancel).await?;
        match parse_plan_reply(&text)? {
            ModelReply::Plan {
                entries,
                reasoning,
                complexity,
            } => Ok(StepOutcome::Plan {
                plan: Plan::initial(entries),
                reasoning,
                complexity,
            }),
            _ => Err(AppError::model_response("expected a plan")),
        }
    }

    async fn run_execution(
        &self,
        step: &ValidatedStep<'_>,
        cancel: &CancellationToken,
    ) -> AppResult<StepOutcome> {
        let request = step.request;
        let index = request.step_index;
        let prompt = build_step_prompt(&step.prompt_input(self.config.analysis.max_steps));
        let text = self
            .call_model(&prompt.system, prompt.messages.clone(), cancel)
            .await?;
        let fallback_title = || format!("Step {}", index);
        let synthesized = |extra: Option<&StepResult>| {
            let mut records = request.previous_steps.clone();
            if let Some(result) = extra {
                records.push(record_of(index, result));
            }
            synthesize_summary(request.question.trim(), &records)
        };

        match parse_execution_reply(&text, index)? {
            ModelReply::Summary { summary } => {
                let drafted = summary.unwrap_or_else(|| synthesized(None));
                let summary = self.grounded_summary(step, None, cancel).await?;
                Ok(StepOutcome::Summary {
                    summary: summary.unwrap_or(drafted),
                })
            }
            ModelReply::CannotAnswer {
                title,
                explanation,
                done,
                summary,
            } => {
                let result = StepResult {
                    title: title.unwrap_or_else(fallback_title),
                    cannot_answer: Some(explanation),
                    ..Default::default()
                };
                let summary = match (done, summary) {
                    (true, drafted) => {
                        let drafted = drafted.unwrap_or_else(|| synthesized(Some(&result)));
                        let grounded = self.grounded_summary(step, None, cancel).await?;
                        Some(grounded.unwrap_or(drafted))
                    }
                    (false, summary) => summary,
                };
                Ok(StepOutcome::CannotAnswer {
                    step: result,
                    done,
                    summary,
                })
            }
            ModelReply::Execution {
                draft,
                reasoning,
                revised_plan,
                done,
                summary,
            } => {
                validate_sql(&draft.sql)?;
                let mut result = StepResult {
                    title: draft.title.unwrap_or_else(fallback_title),
                    sql: Some(draft.sql),
                    chart_type: draft.chart_type,
                    insight: Some(draft.insight),
                    ..Default::default()
                };
                self.execute_with_repair(&prompt, &mut result, step, cancel)
                    .await?;
                self.ground_insight(step, &mut result, cancel).await?;

                if done {
                    let drafted = summary.unwrap_or_else(|| synthesized(Some(&result)));
                    let grounded = self.grounded_summary(step, Some(&result), cancel).await?;
                    Ok(StepOutcome::Finished {
                        step: result,
                        summary: grounded.unwrap_or(drafted),
                    })
                } else {
                    Ok(StepOutcome::Continue {
                        step: result,
                        reasoning,
                        revised_plan: revised_plan.map(|entries| Plan::revised_at(index, entries)),
                    })
                }
            }
            ModelReply::Plan { .. } => Err(AppError::model_response(
                "unexpected plan at an execution step",
            )),
        }
    }

    /// Execute `result.sql`, repairing once if the engine reports a fixable
    /// error. Query failures end up on `result.error`; only cancellation is
    /// returned as an error. A repair's query, title and chart type replace
    /// the step's only once that query has run successfully.
    async fn execute_with_repair(
        &self,
        prompt: &StepPrompt,
        result: &mut StepResult,
        step: &ValidatedStep<'_>,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let dataset = Some(step.dataset.key.as_str());
        let mut sql = result.sql.clone().unwrap_or_default();
        let mut attempt = RepairAttempt::Initial;
        let mut original_error: Option<String> = None;
        let mut pending: Option<RepairDraft> = None;

        loop {
            let err = match self.queries.execute(&sql, dataset, cancel).await {
                Ok(rows) => {
                    if let Some(repair) = pending.take() {
                        apply_repair(result, repair);
                    }
                    attach_rows(result, rows);
                    return Ok(());
                }
                Err(QueryError::Cancelled) => return Err(AppError::Cancelled),
                Err(err) => err,
            };
            let message = original_error.get_or_insert_with(|| err.to_string()).clone();

            let next = attempt.next().filter(|_| is_fixable(&err));
            let Some(next) = next else {
                attach_error(result, message);
                return Ok(());
            };

            tracing::info!(
                session_id = %step.request.session_id,
                step_index = step.request.step_index,
                error = %err,
                "fixable SQL error, requesting repair"
            );
            match self.request_repair(prompt, &sql, &message, cancel).await? {
                Some(repair) => {
                    sql = repair.sql.clone();
                    pending = Some(repair);
                    attempt = next;
                }
                None => {
                    attach_error(result, message);
                    return Ok(());
                }
            }
        }
    }

    /// Ask the model to fix `failed_sql`. `None` when the reply is unusable
    /// or its query fails the safety gate.
    async fn request_repair(
        &self,
        prompt: &StepPrompt,
        failed_sql: &str,
        error: &str,
        cancel: &CancellationToken,
    ) -> AppResult<Option<RepairDraft>> {
        let mut messages = prompt.messages.clone();
        messages.push(Message::assistant(failed_sql));
        messages.push(Message::user(format!(
            "That SQL query failed with this error:\n{}\n\nPlease fix the query. Respond with the same JSON format.",
            error
        )));

        let text = match self.call_model(&prompt.system, messages, cancel).await {
            Ok(text) => text,
            Err(AppError::Cancelled) => return Err(AppError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "repair call failed");
                return Ok(None);
            }
        };
        let Some(repair) = parse_repair_reply(&text) else {
            tracing::warn!("repair reply carried no query");
            return Ok(None);
        };
        if let Err(rejection) = validate_sql(&repair.sql) {
            tracing::warn!(reason = %rejection, "repaired query rejected");
            return Ok(None);
        }
        Ok(Some(repair))
    }

    /// Replace the drafted insight with one written from the step's rows.
    async fn ground_insight(
        &self,
        step: &ValidatedStep<'_>,
        result: &mut StepResult,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let Some(narrator) = &self.narrator else {
            return Ok(());
        };
        let has_rows = result.columns.as_ref().is_some_and(|c| !c.is_empty());
        if result.error.is_some() || !has_rows {
            return Ok(());
        }
        let (Some(sql), Some(summary)) = (result.sql.as_deref(), result.result_summary.as_deref())
        else {
            return Ok(());
        };

        let grounded = narrator
            .step_insight(
                step.request.question.trim(),
                &result.title,
                sql,
                summary,
                step.dataset,
                cancel,
            )
            .await?;
        if let Some(insight) = grounded {
            result.insight = Some(insight);
        }
        Ok(())
    }

    /// Final summary written from every executed step's results, `current`
    /// included when it produced any. `None` without a narrator, without
    /// executed steps, or when the call fails.
    async fn grounded_summary(
        &self,
        step: &ValidatedStep<'_>,
        current: Option<&StepResult>,
        cancel: &CancellationToken,
    ) -> AppResult<Option<String>> {
        let Some(narrator) = &self.narrator else {
            return Ok(None);
        };
        let request = step.request;
        let mut records: Vec<StepRecord> = request
            .previous_steps
            .iter()
            .filter(|r| r.step_index > 0)
            .cloned()
            .collect();
        if let Some(result) = current.filter(|r| r.result_summary.is_some()) {
            records.push(record_of(request.step_index, result));
        }
        narrator
            .final_summary(request.question.trim(), &records, step.dataset, cancel)
            .await
    }

    /// One deterministic model call, abandoned as soon as `cancel` fires.
    async fn call_model(
        &self,
        system: &str,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> AppResult<String> {
        let started = Instant::now();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            res = self.provider.complete(
                CompletionRequest::new(messages).with_system(system).deterministic()
            ) => res?,
        };
        tracing::debug!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model call finished"
        );
        response
            .into_text()
            .ok_or_else(|| AppError::model_response("No response generated."))
    }
}

fn apply_repair(result: &mut StepResult, repair: RepairDraft) {
    result.sql = Some(repair.sql);
    if let Some(title) = repair.title {
        result.title = title;
    }
    if let Some(chart_type) = repair.chart_type {
        result.chart_type = chart_type;
    }
}

fn attach_rows(result: &mut StepResult, rows: ResultSet) {
    result.result_summary = Some(summarize_results(&rows));
    result.columns = Some(rows.columns);
    result.rows = Some(rows.rows);
    result.error = None;
}

fn attach_error(result: &mut StepResult, error: String) {
    result.error = Some(error);
    result.columns = Some(Vec::new());
    result.rows = Some(Vec::new());
    result.result_summary = None;
}

/// Ledger projection of an executed step.
pub fn record_of(step_index: usize, result: &StepResult) -> StepRecord {
    StepRecord {
        step_index,
        title: result.title.clone(),
        sql: result.sql.clone(),
        result_summary: result.result_summary.clone(),
        insight: result.insight.clone().or_else(|| result.cannot_answer.clone()),
        error: result.error.clone(),
    }
}
