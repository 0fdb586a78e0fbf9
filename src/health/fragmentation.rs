//! Gaps between consecutive memory creations.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{HealthStatus, StageBudget, StageOutcome};
use crate::config::HealthConfig;

#[derive(Debug, Clone, Serialize)]
pub struct FragmentationAnalysis {
    #[serde(flatten)]
    pub outcome: StageOutcome,
    /// Memories whose creation times were examined.
    pub total: usize,
    /// Gaps longer than the threshold.
    pub fragmented: usize,
    /// `fragmented / total * 100`.
    pub percentage: f64,
    pub gap_threshold_secs: u64,
    pub largest_gap_secs: i64,
}

impl FragmentationAnalysis {
    pub(crate) fn degraded(outcome: StageOutcome, config: &HealthConfig) -> Self {
        Self {
            outcome,
            total: 0,
            fragmented: 0,
            percentage: 0.0,
            gap_threshold_secs: config.fragmentation_gap_secs,
            largest_gap_secs: 0,
        }
    }
}

/// Classify a fragmentation percentage.
pub fn fragmentation_status(percentage: f64, config: &HealthConfig) -> HealthStatus {
    if percentage > config.fragmentation_error_pct {
        HealthStatus::Error
    } else if percentage >= config.fragmentation_warning_pct {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

/// Sort creation times and count the gaps over `fragmentation_gap_secs`.
pub fn analyze_fragmentation(
    mut created: Vec<DateTime<Utc>>,
    config: &HealthConfig,
    budget: &StageBudget,
) -> FragmentationAnalysis {
    created.sort_unstable();
    let threshold = config.fragmentation_gap_secs.min(i64::MAX as u64) as i64;

    let mut fragmented = 0;
    let mut largest = 0i64;
    let mut examined = created.len().min(1);
    for (i, pair) in created.windows(2).enumerate() {
        if i % 1024 == 0 && budget.exhausted() {
            break;
        }
        let gap = (pair[1] - pair[0]).num_seconds();
        largest = largest.max(gap);
        if gap > threshold {
            fragmented += 1;
        }
        examined = i + 2;
    }

    let percentage = if examined == 0 {
        0.0
    } else {
        fragmented as f64 / examined as f64 * 100.0
    };

    FragmentationAnalysis {
        outcome: StageOutcome {
            status: fragmentation_status(percentage, config),
            budget_exhausted: examined < created.len(),
            ..StageOutcome::default()
        },
        total: examined,
        fragmented,
        percentage,
        gap_threshold_secs: config.fragmentation_gap_secs,
        largest_gap_secs: largest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn timeline(short_gaps: usize, long_gaps: usize) -> Vec<DateTime<Utc>> {
        let mut t = Utc::now() - Duration::days(30);
        let mut out = vec![t];
        // Interleave so sorting has work to do
        for i in 0..(short_gaps + long_gaps) {
            t += if i % 2 == 0 && i / 2 < long_gaps {
                Duration::hours(2)
            } else {
                Duration::minutes(1)
            };
            out.push(t);
        }
        out.reverse();
        out
    }

    #[test]
    fn forty_percent_gaps_is_an_error() {
        let config = HealthConfig::default();
        let created = timeline(59, 40);
        assert_eq!(created.len(), 100);

        let analysis = analyze_fragmentation(created, &config, &StageBudget::unlimited());
        assert_eq!(analysis.total, 100);
        assert_eq!(analysis.fragmented, 40);
        assert!(analysis.percentage >= 30.0);
        assert_eq!(analysis.outcome.status, HealthStatus::Error);
        assert_eq!(analysis.largest_gap_secs, 7_200);
    }

    #[test]
    fn thresholds_split_healthy_warning_error() {
        let config = HealthConfig::default();
        assert_eq!(fragmentation_status(10.0, &config), HealthStatus::Healthy);
        assert_eq!(fragmentation_status(15.0, &config), HealthStatus::Warning);
        assert_eq!(fragmentation_status(30.0, &config), HealthStatus::Warning);
        assert_eq!(fragmentation_status(30.1, &config), HealthStatus::Error);
    }

    #[test]
    fn empty_and_single_are_healthy() {
        let config = HealthConfig::default();
        let empty = analyze_fragmentation(vec![], &config, &StageBudget::unlimited());
        assert_eq!(empty.total, 0);
        assert_eq!(empty.outcome.status, HealthStatus::Healthy);

        let single = analyze_fragmentation(vec![Utc::now()], &config, &StageBudget::unlimited());
        assert_eq!(single.total, 1);
        assert_eq!(single.percentage, 0.0);
    }
}
