//! Health Monitor: read-only diagnostics over the whole store.
//!
//! A run walks `Idle -> Fragmentation -> Duplicates -> Orphans -> Performance
//! -> Recommendations -> Idle`. Stages are independent: a stage that fails
//! internally reports `status: unknown` with its error and the run carries on.
//! Each stage has a wall-clock budget and bounded sample sizes, and says so
//! in its result when either cut it short.
//!
//! The only mutating operation is [`HealthMonitor::consolidate_duplicates`],
//! and it runs only when called explicitly.

pub mod duplicates;
pub mod fragmentation;
pub mod orphans;
pub mod performance;
pub mod recommendations;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::backend::{ListFilter, ListOrder, StoreStats};
use crate::config::HealthConfig;
use crate::error::Result;
use crate::memory::retrieval::RetrievalCoordinator;
use crate::memory::tiered::{ConsolidationOutcome, TieredStore};

use duplicates::{DuplicateAnalysis, DuplicateGroup};
use fragmentation::FragmentationAnalysis;
use orphans::OrphanAnalysis;
use performance::{PerformanceMetrics, PerformanceTracker};
use recommendations::Recommendation;

/// Ordered by severity: `Healthy < Unknown < Warning < Error`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    #[default]
    Unknown,
    Warning,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unknown => "unknown",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStage {
    Idle,
    Fragmentation,
    Duplicates,
    Orphans,
    Performance,
    Recommendations,
}

impl HealthStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fragmentation => "fragmentation",
            Self::Duplicates => "duplicates",
            Self::Orphans => "orphans",
            Self::Performance => "performance",
            Self::Recommendations => "recommendations",
        }
    }
}

impl std::fmt::Display for HealthStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Fields every stage result carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageOutcome {
    pub status: HealthStatus,
    /// The stage looked at a bounded subset of the store.
    pub sampled: bool,
    /// The stage ran out of time and stopped early.
    pub budget_exhausted: bool,
    /// The run was cancelled before this stage started.
    pub skipped: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StageOutcome {
    pub fn degraded(error: String) -> Self {
        Self {
            status: HealthStatus::Unknown,
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: HealthStatus::Unknown,
            skipped: true,
            error: Some("cancelled".into()),
            ..Self::default()
        }
    }
}

/// Wall-clock allowance for one stage, cut short by cancellation.
#[derive(Debug, Clone)]
pub struct StageBudget {
    started: Instant,
    limit: Duration,
    cancel: CancellationToken,
}

impl StageBudget {
    pub fn new(limit: Duration, cancel: CancellationToken) -> Self {
        Self {
            started: Instant::now(),
            limit,
            cancel,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(Duration::MAX, CancellationToken::new())
    }

    pub fn exhausted(&self) -> bool {
        self.cancel.is_cancelled() || self.started.elapsed() >= self.limit
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub overall_status: HealthStatus,
    /// `None` when the relational backend could not be read.
    pub store_stats: Option<StoreStats>,
    pub fragmentation: FragmentationAnalysis,
    pub duplicates: DuplicateAnalysis,
    pub orphans: OrphanAnalysis,
    pub performance: PerformanceMetrics,
    pub recommendations: Vec<Recommendation>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

pub struct HealthMonitor {
    store: Arc<TieredStore>,
    retrieval: Arc<RetrievalCoordinator>,
    config: HealthConfig,
    stage: Mutex<HealthStage>,
    performance: PerformanceTracker,
}

impl HealthMonitor {
    pub fn new(store: Arc<TieredStore>, retrieval: Arc<RetrievalCoordinator>, config: HealthConfig) -> Self {
        let performance = PerformanceTracker::new(config.performance_window, config.slow_query_ms);
        Self {
            store,
            retrieval,
            config,
            stage: Mutex::new(HealthStage::Idle),
            performance,
        }
    }

    /// Stage the current run is in; `Idle` between runs.
    pub fn current_stage(&self) -> HealthStage {
        self.stage.lock().map(|s| *s).unwrap_or(HealthStage::Idle)
    }

    pub fn run(&self, cancel: &CancellationToken) -> HealthReport {
        self.run_at(Utc::now(), cancel)
    }

    /// Run every stage as of `now`. Always returns a report; on cancellation
    /// the stages not yet started are marked skipped.
    pub fn run_at(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> HealthReport {
        let started = Instant::now();
        tracing::info!("health check started");

        let store_stats = match self.store.stats() {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!(error = %e, "store statistics unavailable");
                None
            }
        };

        let fragmentation = match self.enter(HealthStage::Fragmentation, cancel) {
            Some(budget) => self.fragmentation_with(&budget),
            None => FragmentationAnalysis::degraded(StageOutcome::skipped(), &self.config),
        };
        let duplicates = match self.enter(HealthStage::Duplicates, cancel) {
            Some(budget) => self.duplicates_with(&budget),
            None => DuplicateAnalysis::degraded(StageOutcome::skipped(), self.config.duplicate_threshold),
        };
        let orphans = match self.enter(HealthStage::Orphans, cancel) {
            Some(budget) => self.orphans_with(now, &budget),
            None => OrphanAnalysis::degraded(StageOutcome::skipped()),
        };
        let performance = match self.enter(HealthStage::Performance, cancel) {
            Some(budget) => self.performance_with(&budget),
            None => {
                let mut skipped = self.performance.snapshot();
                skipped.outcome = StageOutcome::skipped();
                skipped
            }
        };

        self.set_stage(HealthStage::Recommendations);
        let recommendations = recommendations::recommend(
            &fragmentation,
            &duplicates,
            &orphans,
            &performance,
            &self.config,
        );
        self.set_stage(HealthStage::Idle);

        let overall_status = [
            fragmentation.outcome.status,
            duplicates.outcome.status,
            orphans.outcome.status,
            performance.outcome.status,
        ]
        .into_iter()
        .max()
        .unwrap_or_default();

        let report = HealthReport {
            generated_at: now,
            overall_status,
            store_stats,
            fragmentation,
            duplicates,
            orphans,
            performance,
            recommendations,
            cancelled: cancel.is_cancelled(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            status = %report.overall_status,
            duplicates = report.duplicates.duplicate_count,
            orphans = report.orphans.orphans.len(),
            fragmentation_pct = report.fragmentation.percentage,
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "health check finished"
        );
        report
    }

    // ── Individual stages ─────────────────────────────────────────────────

    pub fn check_fragmentation(&self) -> FragmentationAnalysis {
        self.fragmentation_with(&self.budget(&CancellationToken::new()))
    }

    pub fn check_duplicates(&self) -> DuplicateAnalysis {
        self.duplicates_with(&self.budget(&CancellationToken::new()))
    }

    pub fn check_orphans(&self, now: DateTime<Utc>) -> OrphanAnalysis {
        self.orphans_with(now, &self.budget(&CancellationToken::new()))
    }

    pub fn check_performance(&self) -> PerformanceMetrics {
        self.performance_with(&self.budget(&CancellationToken::new()))
    }

    /// Merge one reported duplicate group. Explicit only; runs never call this.
    pub fn consolidate_duplicates(&self, group: &DuplicateGroup) -> Result<ConsolidationOutcome> {
        self.store.consolidate(&group.ids())
    }

    fn fragmentation_with(&self, budget: &StageBudget) -> FragmentationAnalysis {
        let result = self.scan_memories().map(|(memories, sampled)| {
            let created = memories.iter().map(|m| m.created_at).collect();
            let mut analysis = fragmentation::analyze_fragmentation(created, &self.config, budget);
            analysis.outcome.sampled = sampled;
            analysis
        });
        let mut analysis = result.unwrap_or_else(|e| {
            degrade(HealthStage::Fragmentation, &e);
            FragmentationAnalysis::degraded(StageOutcome::degraded(e.to_string()), &self.config)
        });
        analysis.outcome.duration_ms = budget.elapsed_ms();
        analysis
    }

    fn duplicates_with(&self, budget: &StageBudget) -> DuplicateAnalysis {
        let sample_size = self.config.duplicate_sample_size;
        let result = self
            .store
            .vector_documents(sample_size + 1)
            .and_then(|mut documents| {
                let total = self.store.vector_count()?;
                let sampled = documents.len() > sample_size;
                documents.truncate(sample_size);
                if sampled {
                    tracing::info!(sample_size, total, "duplicate scan sampled");
                }
                Ok(duplicates::find_duplicates(
                    &documents,
                    self.config.duplicate_threshold,
                    total,
                    sampled,
                    budget,
                ))
            });
        let mut analysis = result.unwrap_or_else(|e| {
            degrade(HealthStage::Duplicates, &e);
            DuplicateAnalysis::degraded(
                StageOutcome::degraded(e.to_string()),
                self.config.duplicate_threshold,
            )
        });
        analysis.outcome.duration_ms = budget.elapsed_ms();
        analysis
    }

    fn orphans_with(&self, now: DateTime<Utc>, budget: &StageBudget) -> OrphanAnalysis {
        let result = self.scan_memories().map(|(memories, sampled)| {
            orphans::find_orphans(&memories, now, &self.config, sampled, budget)
        });
        let mut analysis = result.unwrap_or_else(|e| {
            degrade(HealthStage::Orphans, &e);
            OrphanAnalysis::degraded(StageOutcome::degraded(e.to_string()))
        });
        analysis.outcome.duration_ms = budget.elapsed_ms();
        analysis
    }

    /// Issue the probe queries and summarize the rolling window.
    fn performance_with(&self, budget: &StageBudget) -> PerformanceMetrics {
        let mut errors = Vec::new();
        let mut exhausted = false;
        for query in &self.config.probe_queries {
            if budget.exhausted() {
                exhausted = true;
                break;
            }
            let started = Instant::now();
            let result = self.retrieval.probe(query);
            let elapsed = started.elapsed();
            match result {
                Ok(results) => self.performance.record(query, elapsed, results.len(), true),
                Err(e) => {
                    tracing::warn!(query = %query, error = %e, "probe query failed");
                    self.performance.record(query, elapsed, 0, false);
                    errors.push(e.to_string());
                }
            }
        }

        let mut metrics = self.performance.snapshot();
        metrics.outcome.budget_exhausted = exhausted;
        if !errors.is_empty() {
            if metrics.outcome.status == HealthStatus::Unknown {
                degrade_message(HealthStage::Performance, &errors[0]);
            }
            metrics.outcome.error = errors.into_iter().next();
        }
        metrics.outcome.duration_ms = budget.elapsed_ms();
        metrics
    }

    // ── Helpers ───────────────────────────────────────────────────────────

    /// Memories for the scanning stages, newest `scan_limit` only. The flag
    /// says whether the store held more.
    fn scan_memories(&self) -> Result<(Vec<crate::memory::types::Memory>, bool)> {
        let limit = self.config.scan_limit;
        let mut memories = self.store.list(&ListFilter {
            tier: None,
            created_before: None,
            order: ListOrder::CreatedDesc,
            limit: Some(limit + 1),
        })?;
        let sampled = memories.len() > limit;
        memories.truncate(limit);
        Ok((memories, sampled))
    }

    fn budget(&self, cancel: &CancellationToken) -> StageBudget {
        StageBudget::new(Duration::from_millis(self.config.stage_budget_ms), cancel.clone())
    }

    /// Move to `stage` and hand out its budget, or `None` if cancelled.
    fn enter(&self, stage: HealthStage, cancel: &CancellationToken) -> Option<StageBudget> {
        if cancel.is_cancelled() {
            return None;
        }
        self.set_stage(stage);
        tracing::debug!(stage = %stage, "health stage started");
        Some(self.budget(cancel))
    }

    fn set_stage(&self, stage: HealthStage) {
        if let Ok(mut current) = self.stage.lock() {
            *current = stage;
        }
    }
}

fn degrade(stage: HealthStage, err: &crate::error::MemoryError) {
    degrade_message(stage, &err.to_string());
}

fn degrade_message(stage: HealthStage, message: &str) {
    tracing::warn!(stage = %stage, error = %message, "health stage degraded");
}
