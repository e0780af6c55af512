//! SQL Gate Integration Tests

use deep_query_core::sql_guard::FORBIDDEN_KEYWORDS;
use deep_query_core::{strip_code_fences, validate_sql, SqlRejection};

#[test]
fn test_every_forbidden_keyword_is_rejected_in_any_case() {
    for keyword in FORBIDDEN_KEYWORDS {
        let shouting = format!("SELECT * FROM t; {} x", keyword);
        let quiet = format!("select * from t where note = '{}'", keyword.to_lowercase());
        for sql in [shouting, quiet] {
            assert_eq!(
                validate_sql(&sql),
                Err(SqlRejection::ForbiddenKeyword(keyword.to_string())),
                "{}",
                sql
            );
        }
    }
}

#[test]
fn test_minimal_select_is_accepted() {
    assert_eq!(validate_sql("SELECT 1"), Ok(()));
    assert_eq!(validate_sql("select 1;"), Ok(()));
}

#[test]
fn test_fenced_model_output_passes_after_stripping() {
    let raw = "```sql\nSELECT state, SUM(total_paid) FROM claims GROUP BY 1 LIMIT 5;\n```";
    assert!(validate_sql(raw).is_err());
    assert!(validate_sql(strip_code_fences(raw)).is_ok());
}

#[test]
fn test_non_read_statements_are_rejected() {
    for sql in ["SHOW TABLES", "DESCRIBE claims", "VALUES (1)", "EXPLAIN SELECT 1"] {
        assert_eq!(validate_sql(sql), Err(SqlRejection::NotSelect), "{}", sql);
    }
    assert_eq!(validate_sql("   "), Err(SqlRejection::Empty));
}
