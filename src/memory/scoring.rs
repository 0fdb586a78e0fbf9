//! Multi-factor relevance scoring.
//!
//! `score = w_s * semantic + w_r * recency + w_i * importance + w_f * frequency`,
//! each sub-score normalized to `[0, 1]`:
//!
//! - **semantic**: relevance supplied by the caller (vector similarity, or the
//!   exact/semantic blend in hybrid search)
//! - **recency**: `0.5 ^ (hours since last access / half-life)`
//! - **importance**: the memory's own importance
//! - **frequency**: `ln(1 + access_count) / ln(1 + saturation)`, capped at 1
//!
//! Ranking is a total order. Scores within `tie_epsilon` of their sorted
//! neighbour form one tie group; inside a group the more recently accessed
//! memory wins, then the smaller id.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;

use crate::config::{ScoringConfig, ScoringWeights};
use crate::memory::types::Memory;

/// The four normalized sub-scores and their weighted total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub semantic: f64,
    pub recency: f64,
    pub importance: f64,
    pub frequency: f64,
    pub total: f64,
}

/// A memory with its relevance to a query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    /// Whether the exact (keyword) search matched this memory.
    pub exact_match: bool,
}

/// Input to [`ScoringEngine::rank`].
#[derive(Debug, Clone)]
pub struct Candidate {
    pub memory: Memory,
    /// Query relevance in `[0, 1]`, used as the semantic sub-score.
    pub relevance: f64,
    pub exact_match: bool,
}

#[derive(Debug, Clone)]
pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn default_weights(&self) -> ScoringWeights {
        self.config.weights
    }

    pub fn recency_score(&self, last_accessed_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let idle_ms = (now - last_accessed_at).num_milliseconds().max(0) as f64;
        let hours = idle_ms / 3_600_000.0;
        let half_life = self.config.recency_half_life_hours.max(f64::MIN_POSITIVE);
        0.5f64.powf(hours / half_life)
    }

    pub fn frequency_score(&self, access_count: u32) -> f64 {
        if access_count == 0 {
            return 0.0;
        }
        let saturation = self.config.frequency_saturation.max(1) as f64;
        ((1.0 + access_count as f64).ln() / (1.0 + saturation).ln()).min(1.0)
    }

    /// Score one memory against a query relevance.
    pub fn score(
        &self,
        memory: &Memory,
        relevance: f64,
        weights: &ScoringWeights,
        now: DateTime<Utc>,
    ) -> ScoreBreakdown {
        let semantic = relevance.clamp(0.0, 1.0);
        let recency = self.recency_score(memory.last_accessed_at, now);
        let importance = memory.importance.clamp(0.0, 1.0);
        let frequency = self.frequency_score(memory.access_count);

        let total = weights.semantic * semantic
            + weights.recency * recency
            + weights.importance * importance
            + weights.frequency * frequency;

        ScoreBreakdown {
            semantic,
            recency,
            importance,
            frequency,
            total,
        }
    }

    /// Score and sort candidates, best first.
    pub fn rank(
        &self,
        candidates: Vec<Candidate>,
        weights: Option<&ScoringWeights>,
        now: DateTime<Utc>,
    ) -> Vec<ScoredMemory> {
        let weights = weights.copied().unwrap_or(self.config.weights);
        let mut scored: Vec<ScoredMemory> = candidates
            .into_iter()
            .map(|c| {
                let breakdown = self.score(&c.memory, c.relevance, &weights, now);
                ScoredMemory {
                    score: breakdown.total,
                    breakdown,
                    memory: c.memory,
                    exact_match: c.exact_match,
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.memory.id.cmp(&b.memory.id)));

        let epsilon = self.config.tie_epsilon.max(0.0);
        let mut start = 0;
        for i in 1..=scored.len() {
            let split = i == scored.len() || scored[i - 1].score - scored[i].score > epsilon;
            if split {
                scored[start..i].sort_by(tie_break);
                start = i;
            }
        }
        scored
    }
}

/// Order inside a tie group: more recent access first, then id.
fn tie_break(a: &ScoredMemory, b: &ScoredMemory) -> Ordering {
    b.memory
        .last_accessed_at
        .cmp(&a.memory.last_accessed_at)
        .then_with(|| a.memory.id.cmp(&b.memory.id))
}

/// Cosine similarity mapped onto a `[0, 1]` relevance.
pub fn similarity_to_relevance(similarity: f64) -> f64 {
    similarity.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{MemoryContext, Metadata, Tier};
    use chrono::Duration;

    fn engine() -> ScoringEngine {
        ScoringEngine::new(ScoringConfig::default())
    }

    fn memory(id: &str, importance: f64, last_accessed_at: DateTime<Utc>) -> Memory {
        Memory {
            id: id.into(),
            content: "content".into(),
            context: MemoryContext::General,
            importance,
            tier: Tier::Working,
            created_at: last_accessed_at,
            last_accessed_at,
            access_count: 0,
            metadata: Metadata::new(),
        }
    }

    fn candidate(memory: Memory, relevance: f64) -> Candidate {
        Candidate {
            memory,
            relevance,
            exact_match: false,
        }
    }

    #[test]
    fn recency_halves_every_half_life() {
        let now = Utc::now();
        let e = engine();
        assert!((e.recency_score(now, now) - 1.0).abs() < 1e-12);
        assert!((e.recency_score(now - Duration::hours(72), now) - 0.5).abs() < 1e-9);
        assert!((e.recency_score(now - Duration::hours(144), now) - 0.25).abs() < 1e-9);
        // Future timestamps do not exceed 1
        assert!((e.recency_score(now + Duration::hours(1), now) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn frequency_is_log_scaled_and_saturates() {
        let e = engine();
        assert_eq!(e.frequency_score(0), 0.0);
        let ten = e.frequency_score(10);
        let hundred = e.frequency_score(100);
        assert!(ten > 0.0 && ten < hundred);
        assert!((hundred - 1.0).abs() < 1e-12);
        assert_eq!(e.frequency_score(10_000), 1.0);
    }

    #[test]
    fn total_is_weighted_sum() {
        let now = Utc::now();
        let e = engine();
        let m = memory("a", 0.5, now);
        let b = e.score(&m, 0.8, &ScoringWeights::default(), now);
        let expected = 0.4 * 0.8 + 0.3 * 1.0 + 0.2 * 0.5 + 0.1 * 0.0;
        assert!((b.total - expected).abs() < 1e-12);
    }

    #[test]
    fn weights_can_be_overridden_per_query() {
        let now = Utc::now();
        let e = engine();
        let semantic_only = ScoringWeights {
            semantic: 1.0,
            recency: 0.0,
            importance: 0.0,
            frequency: 0.0,
        };
        let ranked = e.rank(
            vec![
                candidate(memory("important", 1.0, now), 0.1),
                candidate(memory("relevant", 0.0, now - Duration::days(30)), 0.9),
            ],
            Some(&semantic_only),
            now,
        );
        assert_eq!(ranked[0].memory.id, "relevant");
        assert!((ranked[0].score - 0.9).abs() < 1e-12);
    }

    #[test]
    fn ties_prefer_recent_access_then_id() {
        let now = Utc::now();
        let e = engine();
        let zero = ScoringWeights {
            semantic: 1.0,
            recency: 0.0,
            importance: 0.0,
            frequency: 0.0,
        };
        let ranked = e.rank(
            vec![
                candidate(memory("b", 0.5, now - Duration::hours(1)), 0.5),
                candidate(memory("c", 0.5, now), 0.5),
                candidate(memory("a", 0.5, now - Duration::hours(1)), 0.5 + 1e-9),
            ],
            Some(&zero),
            now,
        );
        let ids: Vec<&str> = ranked.iter().map(|s| s.memory.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn near_equal_scores_tie_across_any_boundary() {
        let now = Utc::now();
        let e = engine();
        let semantic_only = ScoringWeights {
            semantic: 1.0,
            recency: 0.0,
            importance: 0.0,
            frequency: 0.0,
        };
        // Two scores 2e-9 apart straddling a multiple of half the epsilon
        let mid = 1000.5 * e.config.tie_epsilon;
        let ranked = e.rank(
            vec![
                candidate(memory("older", 0.5, now - Duration::hours(1)), mid + 1e-9),
                candidate(memory("newer", 0.5, now), mid - 1e-9),
                candidate(memory("far", 0.5, now), mid - 1e-3),
            ],
            Some(&semantic_only),
            now,
        );
        let ids: Vec<&str> = ranked.iter().map(|s| s.memory.id.as_str()).collect();
        assert_eq!(ids, vec!["newer", "older", "far"]);
    }

    #[test]
    fn relevance_is_clamped() {
        assert_eq!(similarity_to_relevance(-0.3), 0.0);
        assert_eq!(similarity_to_relevance(0.7), 0.7);
        assert_eq!(similarity_to_relevance(1.2), 1.0);
    }
}
