//! Deterministic rules turning stage results into advice.

use serde::Serialize;

use super::duplicates::DuplicateAnalysis;
use super::fragmentation::FragmentationAnalysis;
use super::orphans::OrphanAnalysis;
use super::performance::PerformanceMetrics;
use super::{HealthStage, HealthStatus, StageOutcome};
use crate::config::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    Consolidate,
    Deduplicate,
    CleanupOrphans,
    OptimizeIndexes,
    InvestigateStage,
    NoAction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub priority: Priority,
    pub message: String,
}

/// Apply the rule list in a fixed order. Never empty.
pub fn recommend(
    fragmentation: &FragmentationAnalysis,
    duplicates: &DuplicateAnalysis,
    orphans: &OrphanAnalysis,
    performance: &PerformanceMetrics,
    config: &HealthConfig,
) -> Vec<Recommendation> {
    let mut out = Vec::new();

    if fragmentation.percentage > config.fragmentation_warning_pct {
        out.push(Recommendation {
            kind: RecommendationKind::Consolidate,
            priority: if fragmentation.outcome.status == HealthStatus::Error {
                Priority::High
            } else {
                Priority::Medium
            },
            message: format!(
                "{:.1}% of creation gaps exceed {}s; consolidate related memories captured in bursts",
                fragmentation.percentage, fragmentation.gap_threshold_secs
            ),
        });
    }

    if duplicates.duplicate_count > config.recommend_duplicates_over {
        out.push(Recommendation {
            kind: RecommendationKind::Deduplicate,
            priority: Priority::Medium,
            message: format!(
                "{} near-duplicate memories in {} groups; consolidate each group",
                duplicates.duplicate_count,
                duplicates.groups.len()
            ),
        });
    }

    if orphans.orphans.len() > config.recommend_orphans_over {
        out.push(Recommendation {
            kind: RecommendationKind::CleanupOrphans,
            priority: Priority::Low,
            message: format!(
                "{} orphaned memories; review and delete the ones no longer needed",
                orphans.orphans.len()
            ),
        });
    }

    if performance.avg_query_ms > config.slow_query_ms as f64 {
        out.push(Recommendation {
            kind: RecommendationKind::OptimizeIndexes,
            priority: Priority::High,
            message: format!(
                "average query time {:.1}ms exceeds {}ms; rebuild indexes or shrink the working set",
                performance.avg_query_ms, config.slow_query_ms
            ),
        });
    }

    let stages: [(HealthStage, &StageOutcome); 4] = [
        (HealthStage::Fragmentation, &fragmentation.outcome),
        (HealthStage::Duplicates, &duplicates.outcome),
        (HealthStage::Orphans, &orphans.outcome),
        (HealthStage::Performance, &performance.outcome),
    ];
    for (stage, outcome) in stages {
        if outcome.status == HealthStatus::Unknown && !outcome.skipped {
            let detail = outcome.error.as_deref().unwrap_or("no measurements");
            out.push(Recommendation {
                kind: RecommendationKind::InvestigateStage,
                priority: Priority::Medium,
                message: format!("{stage} check could not complete ({detail}); re-run diagnostics"),
            });
        }
    }

    if out.is_empty() {
        out.push(Recommendation {
            kind: RecommendationKind::NoAction,
            priority: Priority::Low,
            message: "Memory store is healthy, no action needed".into(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> StageOutcome {
        StageOutcome {
            status: HealthStatus::Healthy,
            ..StageOutcome::default()
        }
    }

    fn inputs() -> (FragmentationAnalysis, DuplicateAnalysis, OrphanAnalysis, PerformanceMetrics) {
        let config = HealthConfig::default();
        let fragmentation = FragmentationAnalysis::degraded(healthy(), &config);
        let duplicates = DuplicateAnalysis::degraded(healthy(), config.duplicate_threshold);
        let orphans = OrphanAnalysis::degraded(healthy());
        let performance = PerformanceMetrics {
            outcome: healthy(),
            avg_query_ms: 5.0,
            max_query_ms: 9.0,
            slow_queries: 0,
            failed_queries: 0,
            samples: 5,
            window_size: 100,
            slow_query_ms: 100,
        };
        (fragmentation, duplicates, orphans, performance)
    }

    #[test]
    fn healthy_store_gets_single_no_action() {
        let (f, d, o, p) = inputs();
        let recs = recommend(&f, &d, &o, &p, &HealthConfig::default());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, RecommendationKind::NoAction);
    }

    #[test]
    fn each_threshold_fires_its_rule() {
        let (mut f, mut d, o, mut p) = inputs();
        f.percentage = 40.0;
        f.outcome.status = HealthStatus::Error;
        d.duplicate_count = 11;
        p.avg_query_ms = 250.0;

        let recs = recommend(&f, &d, &o, &p, &HealthConfig::default());
        let kinds: Vec<RecommendationKind> = recs.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RecommendationKind::Consolidate,
                RecommendationKind::Deduplicate,
                RecommendationKind::OptimizeIndexes,
            ]
        );
        assert_eq!(recs[0].priority, Priority::High);
    }

    #[test]
    fn unknown_stage_is_flagged_unless_skipped() {
        let (f, d, mut o, p) = inputs();
        o.outcome = StageOutcome::degraded("relational backend unavailable".into());
        let recs = recommend(&f, &d, &o, &p, &HealthConfig::default());
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, RecommendationKind::InvestigateStage);
        assert!(recs[0].message.contains("orphans"));

        o.outcome = StageOutcome::skipped();
        let recs = recommend(&f, &d, &o, &p, &HealthConfig::default());
        assert_eq!(recs[0].kind, RecommendationKind::NoAction);
    }
}
