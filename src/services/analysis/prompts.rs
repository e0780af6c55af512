//! Prompt Builder
//!
//! Builds the system instructions and conversation history for each model
//! call. Everything here is a pure function of its input so that the step
//! executor can stay stateless between calls.

use deep_query_core::{PriorAnalysis, StepRecord, MAX_RESULT_ROWS};
use deep_query_llm::Message;

use crate::models::settings::DatasetProfile;

/// Everything a step prompt depends on.
#[derive(Debug, Clone)]
pub struct PromptInput<'a> {
    pub question: &'a str,
    pub step_index: usize,
    /// Model calls per run, the plan step included
    pub max_steps: usize,
    pub previous_steps: &'a [StepRecord],
    /// Already filtered and sorted
    pub years: Option<&'a [i32]>,
    pub dataset: &'a DatasetProfile,
    /// Only consulted at step 0
    pub prior_analyses: &'a [PriorAnalysis],
}

impl PromptInput<'_> {
    /// Steps left in the budget, this one included.
    pub fn remaining_steps(&self) -> usize {
        self.max_steps.saturating_sub(self.step_index)
    }
}

/// System instructions plus the turns to send.
#[derive(Debug, Clone, PartialEq)]
pub struct StepPrompt {
    pub system: String,
    pub messages: Vec<Message>,
}

/// Build the prompt for one step of a deep analysis.
pub fn build_step_prompt(input: &PromptInput<'_>) -> StepPrompt {
    let year_constraint = year_constraint(input.dataset, input.years);
    let instructions = if input.step_index == 0 {
        planning_instructions(input.max_steps, input.prior_analyses, &year_constraint)
    } else {
        execution_instructions(input.step_index, input.remaining_steps(), &year_constraint)
    };

    StepPrompt {
        system: format!("{}\n\n{}", analyst_preamble(input.dataset), instructions),
        messages: conversation_history(input.question, input.step_index, input.previous_steps),
    }
}

/// Shared by every step of every run against a dataset.
fn analyst_preamble(dataset: &DatasetProfile) -> String {
    let mut text = format!(
        "You are an expert data analyst working with the {} dataset, with deep expertise in \
         quantitative analysis and SQL. You reason like a human analyst: you work out what the \
         user wants to know, decide what the final answer should look like, and work backwards \
         to the queries that produce it.",
        dataset.display_name
    );
    if !dataset.domain_knowledge.trim().is_empty() {
        text.push_str("\n\n## Domain Knowledge\n");
        text.push_str(dataset.domain_knowledge.trim());
    }
    if !dataset.schema_prompt.trim().is_empty() {
        text.push_str("\n\n## Schema\n");
        text.push_str(dataset.schema_prompt.trim());
    }
    text.push_str(
        "\n\nYou MUST respond with valid JSON only. No markdown, no code fences, no text outside the JSON.",
    );
    text
}

fn planning_instructions(
    max_steps: usize,
    prior_analyses: &[PriorAnalysis],
    year_constraint: &str,
) -> String {
    let max_queries = max_steps.saturating_sub(1).max(1);
    let mut text = format!(
        r#"This is the PLANNING step. Analyze the question and create an execution plan. Do NOT write any SQL yet.

## How to Plan
1. Understand the ask: what would a complete, satisfying answer look like?
2. Define the final result: its shape and structure.
3. Work backwards: can one well-crafted query answer it? If not, which intermediate results are needed first?
4. Order the steps so that every dependency on an earlier result is resolved.

## Complexity
- "simple": one query answers the question (1 step)
- "moderate": 2-3 queries, possibly dependent
- "complex": up to {max_queries} dependent queries

Response format:
{{
  "plan": [
    {{ "stepNumber": 1, "title": "Brief title", "purpose": "What this step produces and why" }}
  ],
  "reasoning": "2-3 sentences on what the final answer looks like and how the steps build toward it",
  "complexity": "simple|moderate|complex",
  "stepIndex": 0,
  "done": false
}}

Rules for planning:
- If one query answers the question, plan exactly one step.
- Every step must produce a concrete result, never "explore the data".
- When a step depends on an earlier result, say so in its purpose.
- Maximum {max_queries} steps."#
    );

    if !prior_analyses.is_empty() {
        text.push_str("\n\n## Prior Analysis Context");
        for prior in prior_analyses {
            text.push_str(&format!(
                "\nThe user previously analyzed: \"{}\"",
                prior.question
            ));
            if let Some(summary) = prior.summary.as_deref().filter(|s| !s.is_empty()) {
                text.push_str(&format!("\n\nSummary of prior findings:\n{}", summary));
            }
            if !prior.steps.is_empty() {
                text.push_str("\n\nKey findings from each step:");
                for step in &prior.steps {
                    match step.insight.as_deref() {
                        Some(insight) => text.push_str(&format!("\n- {}: {}", step.title, insight)),
                        None => text.push_str(&format!("\n- {}", step.title)),
                    }
                }
            }
        }
        text.push_str(
            "\n\nThis is a FOLLOW-UP question. Build on the prior analysis: reference the specific \
             values it identified and do not repeat queries that were already answered.",
        );
    }

    text.push_str(year_constraint);
    text
}

fn execution_instructions(step_index: usize, remaining_steps: usize, year_constraint: &str) -> String {
    let final_step = remaining_steps <= 1;
    let mut text = format!(
        "This is step {step_index} of the analysis. You have {remaining_steps} step(s) remaining (including this one)."
    );
    if final_step {
        text.push_str(
            "\n\nThis is your FINAL step. You MUST set \"done\": true and include a comprehensive \"summary\" that answers the question.",
        );
    }
    text.push_str(
        "\n\nWrite exactly one SQL query for this step. Results of earlier steps have been provided; \
         use their specific values (codes, identifiers, states) in your query.",
    );

    if !final_step {
        text.push_str(&format!(
            r#"

Response format for a continuing step:
{{
  "step": {{
    "title": "Brief title",
    "sql": "SELECT ... FROM ... LIMIT ...",
    "chartType": "table|line|bar|pie",
    "insight": "What this result is expected to show and why it matters"
  }},
  "reasoning": "How this step feeds the next one",
  "revisedPlan": null,
  "done": false,
  "stepIndex": {step_index}
}}

If prior results change what you need next, you may revise the remaining plan:
"revisedPlan": [
  {{ "stepNumber": {next}, "title": "New title", "purpose": "New purpose" }}
]
Set "revisedPlan" to null if the plan still works."#,
            next = step_index + 1
        ));
    }

    text.push_str(&format!(
        r#"

If this step completes the analysis:
{{
  "step": {{ "title": "...", "sql": "...", "chartType": "...", "insight": "..." }},
  "summary": "Comprehensive answer to the question",
  "done": true,
  "stepIndex": {step_index}
}}

If no further query is needed and you only want to summarize earlier results:
{{ "summary": "...", "done": true, "stepIndex": {step_index} }}

Rules:
- The SQL must be a single SELECT statement with a LIMIT clause (max {MAX_RESULT_ROWS}).
- Keep titles under 60 characters.
- chartType: "line" for time series, "bar" for rankings and comparisons, "pie" for proportions with fewer than 8 categories, "table" otherwise.
- "insight" is required for every query.
- Use short, distinct table aliases and define every alias in FROM or JOIN.
- If the available tables cannot answer this step, put "cannotAnswer" with an explanation in the step instead of "sql"."#
    ));

    text.push_str(year_constraint);
    text
}

/// Replay of the ledger. Step 0 sees only the question.
fn conversation_history(question: &str, step_index: usize, previous_steps: &[StepRecord]) -> Vec<Message> {
    let mut messages = vec![Message::user(format!("Analyze this question: {}", question))];
    if step_index == 0 {
        return messages;
    }

    for record in previous_steps {
        let mut parts = Vec::new();
        if !record.title.is_empty() {
            parts.push(format!("Step {}: {}", record.step_index, record.title));
        }
        if let Some(sql) = &record.sql {
            parts.push(format!("SQL: {}", sql));
        }
        if let Some(insight) = &record.insight {
            parts.push(format!("Interpretation: {}", insight));
        }
        if !parts.is_empty() {
            messages.push(Message::assistant(parts.join("\n")));
        }

        let follow_up = if let Some(error) = &record.error {
            format!(
                "Step {} failed with error: {}\nAdjust your approach for the next step.",
                record.step_index, error
            )
        } else if let Some(summary) = &record.result_summary {
            format!(
                "Step {} results:\n{}\n\nUse these results to inform your next step. Continue executing the plan.",
                record.step_index, summary
            )
        } else {
            "Plan confirmed. Begin executing the analysis.".to_string()
        };
        messages.push(Message::user(follow_up));
    }

    messages
}

/// WHERE-clause instruction for the selected years, empty without a filter.
pub fn year_constraint(dataset: &DatasetProfile, years: Option<&[i32]>) -> String {
    let (Some(column), Some(years)) = (dataset.date_column.as_deref(), years) else {
        return String::new();
    };
    match years {
        [] => String::new(),
        [year] => format!(
            "\n\nIMPORTANT: The user has selected year {year} as a filter. You MUST add a WHERE clause \
             restricting data to {year}. Use: WHERE {column} >= '{year}-01-01' AND {column} < '{next}-01-01'.",
            next = year + 1
        ),
        _ => {
            let listed = years
                .iter()
                .map(|y| y.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let conditions = years
                .iter()
                .map(|y| format!("({column} >= '{y}-01-01' AND {column} < '{}-01-01')", y + 1))
                .collect::<Vec<_>>()
                .join(" OR ");
            format!(
                "\n\nIMPORTANT: The user has selected years {listed} as a filter. You MUST add a WHERE \
                 clause restricting data to these years. Use: WHERE {conditions}."
            )
        }
    }
}

// ============================================================================
// Post-execution narration
// ============================================================================

fn narration_system(role: &str, dataset: &DatasetProfile) -> String {
    let mut system = role.to_string();
    if !dataset.domain_knowledge.trim().is_empty() {
        system.push_str("\n\nKeep these dataset caveats in mind:\n");
        system.push_str(dataset.domain_knowledge.trim());
    }
    system
}

/// Prompt for a 1-2 sentence insight written from a step's actual results.
pub fn build_insight_prompt(
    question: &str,
    title: &str,
    sql: &str,
    result_summary: &str,
    dataset: &DatasetProfile,
) -> StepPrompt {
    let system = narration_system(
        "You are a concise data analyst. Given SQL query results, write a 1-2 sentence insight \
         citing specific numbers from the data. Only reference numbers that appear in the \
         results and do not speculate beyond the data shown.",
        dataset,
    );
    let content = format!(
        "User question: {question}\nStep: {title}\nSQL: {sql}\n\nActual query results:\n{result_summary}\n\n\
         Write a concise insight (1-2 sentences) interpreting these results. Cite specific numbers."
    );
    StepPrompt {
        system,
        messages: vec![Message::user(content)],
    }
}

/// Prompt for the final answer, written from the result summaries of every
/// executed step. `steps` excludes the plan record.
pub fn build_summary_prompt(
    question: &str,
    steps: &[StepRecord],
    dataset: &DatasetProfile,
) -> StepPrompt {
    let system = narration_system(
        "You are a data analyst. Synthesize query results into a clear summary. Structure: \
         (1) direct answer with key numbers, (2) most important findings, (3) caveats or context. \
         Only cite numbers from the actual results; never guess or extrapolate.",
        dataset,
    );
    let context = steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let mut block = format!("Step {}: {}", i + 1, step.title);
            if let Some(insight) = &step.insight {
                block.push_str(&format!("\nInsight: {}", insight));
            }
            if let Some(summary) = &step.result_summary {
                block.push_str(&format!("\nResults:\n{}", summary));
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    let content = format!(
        "Question: {question}\n\n{context}\n\n\
         Write a comprehensive 2-3 paragraph summary answering the question. Only cite numbers from the actual results above."
    );
    StepPrompt {
        system,
        messages: vec![Message::user(content)],
    }
}

// ============================================================================
// Single-shot
// ============================================================================

/// Prompt for the single-shot path: the reply is bare SQL.
///
/// `retry` carries the failed SQL and the engine's error for a client-driven
/// second attempt.
pub fn build_single_shot_prompt(
    question: &str,
    dataset: &DatasetProfile,
    years: Option<&[i32]>,
    retry: Option<(&str, &str)>,
) -> StepPrompt {
    let mut system = format!(
        "You are a SQL expert that translates natural language questions into SQL queries for the {} dataset.",
        dataset.display_name
    );
    if !dataset.schema_prompt.trim().is_empty() {
        system.push_str("\n\n");
        system.push_str(dataset.schema_prompt.trim());
    }
    system.push_str(&format!(
        "\n\nRules:\n\
         - Return ONLY the SQL query, nothing else. No markdown, no explanation, no code fences.\n\
         - Always include a LIMIT clause (max {MAX_RESULT_ROWS}).\n\
         - Only use SELECT statements.\n\
         - When a question is ambiguous, make reasonable assumptions.\n\
         - Use short, distinct table aliases and define every alias in FROM or JOIN."
    ));
    system.push_str(&year_constraint(dataset, years));

    let mut messages = vec![Message::user(question)];
    if let Some((failed_sql, error)) = retry {
        messages.push(Message::assistant(failed_sql));
        messages.push(Message::user(format!(
            "That SQL query failed with this error:\n{}\n\nPlease fix the query and return only the corrected SQL.",
            error
        )));
    }

    StepPrompt { system, messages }
}
