//! Response Cache Integration Tests

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use deep_query::models::settings::AppConfig;
use deep_query::services::query_cache::{cache_key, normalize_question, CacheEntry, QueryCache};
use deep_query::services::single_shot::{QueryRequest, QueryService};
use deep_query_core::{ChartType, ResultSet};

use crate::support::{replies, FakeEngine, FakeModel};

fn entry(sql: &str) -> CacheEntry {
    CacheEntry {
        sql: sql.to_string(),
        chart_type: ChartType::Table,
        columns: vec!["n".into()],
        rows: vec![vec![json!(1)]],
    }
}

#[test]
fn test_normalize_is_idempotent() {
    let questions = [
        "  Top 5 States   by Spending?? ",
        "What changed in 2023!",
        "already normal",
        "Trailing dots...",
        "",
    ];
    for q in questions {
        let once = normalize_question(q);
        assert_eq!(normalize_question(&once), once, "not idempotent for {:?}", q);
    }
    assert_eq!(
        normalize_question("  Top 5 States   by Spending?? "),
        "top 5 states by spending"
    );
}

#[test]
fn test_key_ignores_year_order_and_question_noise() {
    let a = cache_key("Top states?", Some(&[2024, 2022]), Some("medicaid"));
    let b = cache_key("top   STATES", Some(&[2022, 2024, 2022]), Some("medicaid"));
    assert_eq!(a, b);
    assert_eq!(a, "top states|years=2022,2024|ds=medicaid");
    assert_ne!(a, cache_key("top states", None, Some("medicaid")));
    assert_ne!(a, cache_key("top states", Some(&[2022, 2024]), Some("other")));
}

#[test]
fn test_ttl_boundary() {
    let ttl = Duration::from_secs(60);
    let cache = QueryCache::new(10, ttl);
    let t0 = Instant::now();
    cache.put_at("k", entry("SELECT 1"), t0);

    assert!(cache.get_at("k", t0 + ttl - Duration::from_millis(1)).is_some());
    assert!(cache.get_at("k", t0 + ttl).is_none());
    assert!(cache.is_empty());
}

#[test]
fn test_overflow_evicts_earliest_inserted() {
    let cache = QueryCache::new(3, Duration::from_secs(3600));
    let t0 = Instant::now();
    for (i, key) in ["a", "b", "c"].iter().enumerate() {
        cache.put_at(*key, entry(key), t0 + Duration::from_secs(i as u64));
    }

    cache.put_at("d", entry("d"), t0 + Duration::from_secs(6));
    assert_eq!(cache.len(), 3);
    assert!(cache.get_at("a", t0 + Duration::from_secs(7)).is_none());
    for key in ["b", "c", "d"] {
        assert!(cache.get_at(key, t0 + Duration::from_secs(7)).is_some());
    }
}

#[test]
fn test_overflow_spares_recently_read_entry() {
    let cache = QueryCache::new(2, Duration::from_secs(3600));
    let t0 = Instant::now();
    cache.put_at("a", entry("a"), t0);
    cache.put_at("b", entry("b"), t0 + Duration::from_secs(1));
    assert!(cache.get_at("a", t0 + Duration::from_secs(2)).is_some());

    cache.put_at("c", entry("c"), t0 + Duration::from_secs(3));
    assert_eq!(cache.len(), 2);
    assert!(cache.get_at("a", t0 + Duration::from_secs(4)).is_some());
    assert!(cache.get_at("b", t0 + Duration::from_secs(4)).is_none());
}

#[test]
fn test_size_never_exceeds_capacity() {
    let cache = QueryCache::new(4, Duration::from_secs(3600));
    let t0 = Instant::now();
    for i in 0..50u64 {
        cache.put_at(format!("k{}", i % 7), entry("SELECT 1"), t0 + Duration::from_millis(i));
        assert!(cache.len() <= cache.capacity());
    }
}

#[tokio::test]
async fn test_equivalent_questions_hit_without_new_calls() {
    let model = FakeModel::new(replies(&["SELECT state FROM claims ORDER BY 1 LIMIT 5"]));
    let engine = FakeEngine::new(vec![Ok(ResultSet::new(
        vec!["state".into()],
        vec![vec![json!("CA")], vec![json!("NY")]],
    ))]);
    let service = QueryService::new(model.clone(), engine.clone(), Arc::new(AppConfig::default()));
    let cancel = CancellationToken::new();

    let first = service
        .ask(&QueryRequest::new("Top states by spending?"), &cancel)
        .await
        .unwrap();
    assert!(!first.cached);

    let second = service
        .ask(&QueryRequest::new("  top STATES by spending "), &cancel)
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(second.sql, first.sql);
    assert_eq!(second.rows, first.rows);
    assert_eq!(model.calls(), 1);
    assert_eq!(engine.statements().len(), 1);
}

#[tokio::test]
async fn test_retry_sends_failure_back_to_model() {
    let model = FakeModel::new(replies(&[
        "SELECT state FROM claims LIMIT 5",
        "SELECT state FROM claims LIMIT 5",
    ]));
    let engine = FakeEngine::new(vec![Ok(ResultSet::default()), Ok(ResultSet::default())]);
    let service = QueryService::new(model.clone(), engine, Arc::new(AppConfig::default()));
    let cancel = CancellationToken::new();

    service
        .ask(&QueryRequest::new("top states"), &cancel)
        .await
        .unwrap();

    let retry = QueryRequest {
        failed_sql: Some("SELECT stat FROM claims".into()),
        sql_error: Some("Binder Error: stat".into()),
        ..QueryRequest::new("top states")
    };
    let answer = service.ask(&retry, &cancel).await.unwrap();
    assert!(!answer.cached);
    assert_eq!(model.calls(), 2);

    let turns = &model.requests()[1];
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[1].content, "SELECT stat FROM claims");
    assert!(turns[2].content.contains("Binder Error: stat"));
}
