//! SQL Safety Gate
//!
//! Lexical allow/deny check applied to every model-authored query before it
//! reaches the remote engine. This is not a parser: a forbidden keyword is
//! rejected wherever it appears, string literals included.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Statement-level keywords that are never allowed.
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "CREATE", "DROP", "ALTER", "TRUNCATE", "INSERT", "UPDATE", "DELETE", "MERGE", "GRANT",
    "REVOKE", "EXEC", "EXECUTE", "CALL", "COPY", "ATTACH", "DETACH", "LOAD", "INSTALL", "PRAGMA",
];

/// Why a query was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqlRejection {
    #[error("Empty query.")]
    Empty,

    #[error("Only SELECT queries are allowed.")]
    NotSelect,

    #[error("Forbidden SQL keyword detected: {0}")]
    ForbiddenKeyword(String),
}

fn forbidden_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let alternation = FORBIDDEN_KEYWORDS.join("|");
        Regex::new(&format!(r"(?i)\b({})\b", alternation)).expect("valid keyword pattern")
    })
}

/// Trim surrounding whitespace and any trailing semicolons.
pub fn normalize_statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Accept only read queries that contain none of [`FORBIDDEN_KEYWORDS`].
pub fn validate_sql(sql: &str) -> Result<(), SqlRejection> {
    let statement = normalize_statement(sql);
    if statement.is_empty() {
        return Err(SqlRejection::Empty);
    }

    let upper = statement.to_ascii_uppercase();
    if !(upper.starts_with("SELECT") || upper.starts_with("WITH")) {
        return Err(SqlRejection::NotSelect);
    }

    if let Some(m) = forbidden_pattern().find(statement) {
        return Err(SqlRejection::ForbiddenKeyword(
            m.as_str().to_ascii_uppercase(),
        ));
    }

    Ok(())
}

/// Remove a surrounding Markdown code fence (```` ``` ````, ```` ```sql ````,
/// ```` ```json ````) if present.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string on the opening line.
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}
