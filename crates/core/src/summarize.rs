//! Result Summaries
//!
//! Turns a result set into the compact text block fed back to the model as the
//! user turn after each executed step: shape, per-column statistics, notable
//! findings and a short row preview.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::model::ResultSet;

/// Rows shown in the preview section.
pub const MAX_PREVIEW_ROWS: usize = 15;

fn dollar_column() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)paid|spending|cost|amount").expect("valid pattern"))
}

fn beneficiary_column() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)beneficiar").expect("valid pattern"))
}

fn concentration_column() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)paid|spending|cost|amount|claims").expect("valid pattern"))
}

fn time_column() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)month|date|year|period|quarter").expect("valid pattern"))
}

/// Summarize `result` for inclusion in a prompt.
pub fn summarize_results(result: &ResultSet) -> String {
    let columns = &result.columns;
    let row_count = result.row_count();
    let mut sections = vec![format!(
        "SHAPE: {} rows x {} columns ({})",
        row_count,
        columns.len(),
        columns.join(", ")
    )];

    let stat_lines: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, col)| column_statistics(col, result, i))
        .collect();
    if !stat_lines.is_empty() {
        sections.push(format!("STATISTICS:\n{}", stat_lines.join("\n")));
    }

    let mut findings = concentration_findings(result);
    findings.extend(trend_findings(result));
    if !findings.is_empty() {
        let lines: Vec<String> = findings.iter().map(|f| format!("  - {}", f)).collect();
        sections.push(format!("KEY FINDINGS:\n{}", lines.join("\n")));
    }

    let preview: Vec<String> = result
        .rows
        .iter()
        .take(MAX_PREVIEW_ROWS)
        .map(|row| preview_row(columns, row))
        .collect();
    sections.push(format!(
        "DATA PREVIEW (first {} of {} rows):\n{}",
        preview.len(),
        row_count,
        preview.join("\n")
    ));
    if row_count > MAX_PREVIEW_ROWS {
        sections.push(format!(
            "... and {} more rows",
            row_count - MAX_PREVIEW_ROWS
        ));
    }

    sections.join("\n\n")
}

// ============================================================================
// Statistics
// ============================================================================

fn numeric_values(result: &ResultSet, idx: usize) -> Vec<f64> {
    result
        .column_values(idx)
        .filter_map(Value::as_f64)
        .filter(|v| !v.is_nan())
        .collect()
}

fn column_statistics(col: &str, result: &ResultSet, idx: usize) -> String {
    let values = numeric_values(result, idx);
    if values.is_empty() {
        let unique: HashSet<String> = result.column_values(idx).map(cell_text).collect();
        return format!("  {}: {} unique values (categorical)", col, unique.len());
    }

    let mut sorted = values.clone();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let min = sorted[0];
    let max = sorted[n - 1];
    let sum: f64 = values.iter().sum();
    let mean = sum / n as f64;
    let median = if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    };
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    let std_dev = variance.sqrt();

    let skew = if median != 0.0 { mean / median } else { 0.0 };
    let distribution = if skew > 1.5 {
        "RIGHT-SKEWED (long tail of high values)"
    } else if skew > 1.15 {
        "moderately right-skewed"
    } else if skew < 0.67 {
        "LEFT-SKEWED"
    } else if skew < 0.87 {
        "moderately left-skewed"
    } else {
        "symmetric"
    };

    let low = mean - 2.0 * std_dev;
    let high = mean + 2.0 * std_dev;
    let outliers = values.iter().filter(|&&v| v < low || v > high).count();

    let dollar = dollar_column().is_match(col);
    let fmt = |v: f64| {
        if dollar {
            format!("${}", thousands(v.round()))
        } else {
            round_for_display(v)
        }
    };

    let mut line = if beneficiary_column().is_match(col) {
        format!(
            "  {}: min={}, max={}, mean={}, median={}, stdDev={}, distribution={} (DO NOT SUM: beneficiaries overlap across codes/providers)",
            col,
            fmt(min),
            fmt(max),
            fmt(mean),
            fmt(median),
            fmt(std_dev),
            distribution
        )
    } else {
        format!(
            "  {}: min={}, max={}, mean={}, median={}, sum={}, stdDev={}, distribution={}",
            col,
            fmt(min),
            fmt(max),
            fmt(mean),
            fmt(median),
            fmt(sum),
            fmt(std_dev),
            distribution
        )
    };
    if outliers > 0 {
        line.push_str(&format!(", outliers={}/{}", outliers, n));
    }
    line
}

// ============================================================================
// Findings
// ============================================================================

fn concentration_findings(result: &ResultSet) -> Vec<String> {
    let mut findings = Vec::new();
    for (i, col) in result.columns.iter().enumerate() {
        if !concentration_column().is_match(col) || beneficiary_column().is_match(col) {
            continue;
        }
        let mut values = numeric_values(result, i);
        if values.len() < 5 {
            continue;
        }
        values.sort_by(|a, b| b.total_cmp(a));
        let total: f64 = values.iter().sum();
        if total == 0.0 {
            continue;
        }
        let top_count = ((values.len() as f64 * 0.2).ceil() as usize).max(1);
        let top_share = values[..top_count].iter().sum::<f64>() / total * 100.0;
        if top_share > 60.0 {
            findings.push(format!(
                "Concentration: Top 20% of entries account for {}% of {}",
                top_share.round(),
                col
            ));
        }
    }
    findings
}

fn trend_findings(result: &ResultSet) -> Vec<String> {
    let Some(time_idx) = result.columns.iter().position(|c| time_column().is_match(c)) else {
        return Vec::new();
    };
    if result.row_count() < 6 {
        return Vec::new();
    }

    let mut findings = Vec::new();
    for (i, col) in result.columns.iter().enumerate() {
        if i == time_idx {
            continue;
        }
        let values = numeric_values(result, i);
        if values.len() < 6 {
            continue;
        }
        let third = values.len() / 3;
        let avg = |slice: &[f64]| slice.iter().sum::<f64>() / slice.len() as f64;
        let first = avg(&values[..third]);
        let last = avg(&values[values.len() - third..]);
        if first == 0.0 {
            continue;
        }
        let pct = (last - first) / first.abs() * 100.0;
        if pct.abs() > 15.0 {
            let direction = if pct > 0.0 { "INCREASING" } else { "DECREASING" };
            let sign = if pct > 0.0 { "+" } else { "" };
            findings.push(format!(
                "Trend: {} is {} ({}{}% change from first third to last third of data)",
                col,
                direction,
                sign,
                pct.round()
            ));
        }
    }
    findings
}

// ============================================================================
// Formatting
// ============================================================================

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn preview_row(columns: &[String], row: &[Value]) -> String {
    row.iter()
        .enumerate()
        .map(|(i, cell)| {
            let col = columns.get(i).map(String::as_str).unwrap_or("?");
            match cell.as_f64() {
                Some(v) if dollar_column().is_match(col) => {
                    format!("{}=${}", col, thousands(v.round()))
                }
                _ => format!("{}={}", col, cell_text(cell)),
            }
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Integer rendering with `,` thousands separators.
fn thousands(v: f64) -> String {
    let digits = format!("{:.0}", v.abs());
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if v < 0.0 && digits != "0" {
        out.insert(0, '-');
    }
    out
}

fn round_for_display(v: f64) -> String {
    let magnitude = v.abs();
    if magnitude >= 1000.0 {
        thousands(v.round())
    } else if magnitude >= 1.0 {
        format!("{:.1}", v)
    } else if v == 0.0 {
        "0".to_string()
    } else {
        // Three significant digits.
        let decimals = (2 - magnitude.log10().floor() as i32).max(0) as usize;
        format!("{:.*}", decimals, v)
    }
}
