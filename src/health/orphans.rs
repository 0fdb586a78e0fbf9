//! Memories unlikely to be useful again.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{HealthStatus, StageBudget, StageOutcome};
use crate::config::HealthConfig;
use crate::memory::types::{Memory, Tier};

const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrphanedEntry {
    pub id: String,
    pub preview: String,
    pub tier: Tier,
    pub importance: f64,
    pub access_count: u32,
    pub age_days: i64,
    /// Every rule the memory tripped, for explainability.
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrphanAnalysis {
    #[serde(flatten)]
    pub outcome: StageOutcome,
    pub orphans: Vec<OrphanedEntry>,
    pub scanned: usize,
}

impl OrphanAnalysis {
    pub(crate) fn degraded(outcome: StageOutcome) -> Self {
        Self {
            outcome,
            orphans: Vec::new(),
            scanned: 0,
        }
    }
}

/// Why `memory` counts as orphaned as of `now`. Empty when it does not.
pub fn orphan_reasons(memory: &Memory, now: DateTime<Utc>, config: &HealthConfig) -> Vec<String> {
    let mut reasons = Vec::new();
    let idle_days = memory.idle(now).num_days();
    let age_days = memory.age(now).num_days();

    if idle_days >= config.orphan_stale_days && memory.importance < config.orphan_stale_importance {
        reasons.push(format!(
            "Not accessed in {} days with importance below {}",
            config.orphan_stale_days, config.orphan_stale_importance
        ));
    }
    if memory.access_count == 0 && age_days >= config.orphan_never_accessed_days {
        reasons.push(format!(
            "Never accessed after {} days",
            config.orphan_never_accessed_days
        ));
    }
    if memory.importance < config.orphan_low_importance
        && memory.access_count < config.orphan_min_access_count
    {
        reasons.push(format!(
            "Importance below {} with fewer than {} accesses",
            config.orphan_low_importance, config.orphan_min_access_count
        ));
    }
    reasons
}

pub fn find_orphans(
    memories: &[Memory],
    now: DateTime<Utc>,
    config: &HealthConfig,
    sampled: bool,
    budget: &StageBudget,
) -> OrphanAnalysis {
    let mut orphans = Vec::new();
    let mut scanned = 0;
    let mut budget_exhausted = false;

    for memory in memories {
        if scanned % 1024 == 0 && budget.exhausted() {
            budget_exhausted = true;
            break;
        }
        scanned += 1;

        let reasons = orphan_reasons(memory, now, config);
        if !reasons.is_empty() {
            orphans.push(OrphanedEntry {
                id: memory.id.clone(),
                preview: memory.preview(PREVIEW_CHARS),
                tier: memory.tier,
                importance: memory.importance,
                access_count: memory.access_count,
                age_days: memory.age(now).num_days(),
                reasons,
            });
        }
    }

    let status = if orphans.len() > config.recommend_orphans_over {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    };

    OrphanAnalysis {
        outcome: StageOutcome {
            status,
            sampled,
            budget_exhausted,
            ..StageOutcome::default()
        },
        orphans,
        scanned,
    }
}
