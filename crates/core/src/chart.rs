//! Chart-type inference for single-shot answers, where the model is not asked
//! for a rendering hint.

use crate::model::ChartType;

const TREND_WORDS: &[&str] = &["trend", "over time", "monthly", "by month", "by year"];
const RANKING_WORDS: &[&str] = &["top", "compare", "ranking", "highest", "largest"];
const SHARE_WORDS: &[&str] = &["breakdown", "distribution", "share", "proportion", "percentage"];
const TIME_SQL_MARKERS: &[&str] = &["claim_month", "date_trunc", "extract(year"];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Pick a chart from the wording of the question, falling back to the shape
/// of the SQL.
pub fn infer_chart_type(question: &str, sql: &str) -> ChartType {
    let q = question.to_lowercase();
    let s = sql.to_lowercase();

    if contains_any(&q, TREND_WORDS) {
        return ChartType::Line;
    }
    if contains_any(&q, RANKING_WORDS) {
        return ChartType::Bar;
    }
    if contains_any(&q, SHARE_WORDS) {
        return ChartType::Pie;
    }

    if contains_any(&s, TIME_SQL_MARKERS) {
        return ChartType::Line;
    }
    if s.contains("order by") && s.contains("limit") {
        return ChartType::Bar;
    }

    ChartType::Table
}
