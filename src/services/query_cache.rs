//! Single-shot Response Cache
//!
//! Bounded, TTL-limited map from a normalized question key to the SQL and
//! rows it produced. Overflow evicts the least-recently-used entry. A hit
//! refreshes recency but never lifetime: expiry counts from insertion.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

use deep_query_core::ChartType;

use crate::models::settings::CacheSettings;

/// A cached single-shot answer.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub sql: String,
    pub chart_type: ChartType,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug)]
struct Stored {
    entry: CacheEntry,
    created_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, Stored>,
    /// Keys, least-recently-used first
    order: VecDeque<String>,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }
}

/// Thread-safe response cache shared by the HTTP handlers.
#[derive(Debug)]
pub struct QueryCache {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl QueryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.capacity, Duration::from_secs(settings.ttl_secs))
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.get_at(key, Instant::now())
    }

    pub fn put(&self, key: impl Into<String>, entry: CacheEntry) {
        self.put_at(key, entry, Instant::now());
    }

    /// Lookup as of `now`. An expired entry is removed and reported as a miss;
    /// a hit moves the key to the most-recently-used end.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match inner.entries.get(key) {
            None => return None,
            Some(stored) => now.saturating_duration_since(stored.created_at) >= self.ttl,
        };
        if expired {
            inner.remove(key);
            tracing::debug!(key, "cache entry expired");
            return None;
        }
        inner.touch(key);
        inner.entries.get(key).map(|s| s.entry.clone())
    }

    /// Insert as of `now`, evicting the least-recently-used entry on overflow.
    pub fn put_at(&self, key: impl Into<String>, entry: CacheEntry, now: Instant) {
        let key = key.into();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(&key);
        if inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
                tracing::debug!(key = %oldest, "cache entry evicted");
            }
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(
            key,
            Stored {
                entry,
                created_at: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Lower-case, collapse whitespace and strip trailing `?`, `.` and `!`.
pub fn normalize_question(question: &str) -> String {
    let collapsed = question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(|c: char| matches!(c, '?' | '.' | '!') || c.is_whitespace())
        .to_string()
}

/// Cache key for a question, its year filter and its dataset.
pub fn cache_key(question: &str, years: Option<&[i32]>, dataset: Option<&str>) -> String {
    let mut key = normalize_question(question);
    if let Some(years) = years.filter(|y| !y.is_empty()) {
        let mut sorted = years.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let list: Vec<String> = sorted.iter().map(|y| y.to_string()).collect();
        key.push_str("|years=");
        key.push_str(&list.join(","));
    }
    if let Some(dataset) = dataset {
        key.push_str("|ds=");
        key.push_str(dataset);
    }
    key
}
