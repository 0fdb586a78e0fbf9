//! Rolling query-latency window.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::{HealthStatus, StageOutcome};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuerySample {
    pub query: String,
    pub duration_ms: f64,
    pub results: usize,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    #[serde(flatten)]
    pub outcome: StageOutcome,
    pub avg_query_ms: f64,
    pub max_query_ms: f64,
    pub slow_queries: usize,
    pub failed_queries: usize,
    /// Measurements currently in the window.
    pub samples: usize,
    pub window_size: usize,
    pub slow_query_ms: u64,
}

/// Keeps the last `capacity` probe measurements across health runs.
pub struct PerformanceTracker {
    window: Mutex<VecDeque<QuerySample>>,
    capacity: usize,
    slow_query_ms: u64,
}

impl PerformanceTracker {
    pub fn new(capacity: usize, slow_query_ms: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            slow_query_ms,
        }
    }

    pub fn record(&self, query: &str, elapsed: Duration, results: usize, ok: bool) {
        let Ok(mut window) = self.window.lock() else {
            tracing::warn!("performance window lock poisoned, dropping sample");
            return;
        };
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(QuerySample {
            query: query.to_string(),
            duration_ms: elapsed.as_secs_f64() * 1_000.0,
            results,
            ok,
        });
    }

    /// Summarize the window. `Unknown` when it holds no successful query.
    pub fn snapshot(&self) -> PerformanceMetrics {
        let samples: Vec<QuerySample> = match self.window.lock() {
            Ok(window) => window.iter().cloned().collect(),
            Err(_) => Vec::new(),
        };

        let succeeded: Vec<&QuerySample> = samples.iter().filter(|s| s.ok).collect();
        let failed_queries = samples.len() - succeeded.len();
        let slow_threshold = self.slow_query_ms as f64;

        let (avg, max) = if succeeded.is_empty() {
            (0.0, 0.0)
        } else {
            let total: f64 = succeeded.iter().map(|s| s.duration_ms).sum();
            let max = succeeded.iter().map(|s| s.duration_ms).fold(0.0, f64::max);
            (total / succeeded.len() as f64, max)
        };
        let slow_queries = succeeded
            .iter()
            .filter(|s| s.duration_ms > slow_threshold)
            .count();

        let status = if succeeded.is_empty() {
            HealthStatus::Unknown
        } else if avg > slow_threshold {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        PerformanceMetrics {
            outcome: StageOutcome {
                status,
                ..StageOutcome::default()
            },
            avg_query_ms: avg,
            max_query_ms: max,
            slow_queries,
            failed_queries,
            samples: samples.len(),
            window_size: self.capacity,
            slow_query_ms: self.slow_query_ms,
        }
    }
}
