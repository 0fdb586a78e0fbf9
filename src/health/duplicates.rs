//! Near-duplicate detection by token-set overlap.
//!
//! Every pair in the sample is compared (O(n²)), so the sample is bounded by
//! `health.duplicate_sample_size` and the analysis reports when it was cut.

use serde::Serialize;
use std::collections::HashSet;

use super::{HealthStatus, StageBudget, StageOutcome};
use crate::memory::types::truncate_preview;

const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateMember {
    pub id: String,
    pub preview: String,
    /// Similarity to the group's anchor; 1.0 for the anchor itself.
    pub similarity: f64,
}

/// Memories whose content overlaps the anchor's at or above the threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateGroup {
    pub anchor_id: String,
    /// Anchor first.
    pub members: Vec<DuplicateMember>,
    /// Lowest member similarity to the anchor.
    pub similarity: f64,
}

impl DuplicateGroup {
    pub fn ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateAnalysis {
    #[serde(flatten)]
    pub outcome: StageOutcome,
    pub groups: Vec<DuplicateGroup>,
    /// Members beyond each group's anchor, i.e. what consolidation would remove.
    pub duplicate_count: usize,
    pub pairs_compared: u64,
    /// Documents compared; less than `total` when sampled.
    pub sample_size: usize,
    pub total: u64,
    pub threshold: f64,
}

impl DuplicateAnalysis {
    pub(crate) fn degraded(outcome: StageOutcome, threshold: f64) -> Self {
        Self {
            outcome,
            groups: Vec::new(),
            duplicate_count: 0,
            pairs_compared: 0,
            sample_size: 0,
            total: 0,
            threshold,
        }
    }
}

/// Lowercased alphanumeric word set.
pub fn token_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity `|a ∩ b| / |a ∪ b|`. Two empty sets are identical.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Greedy anchor grouping over `(id, content)` documents.
///
/// Each unassigned document in order becomes an anchor and claims every
/// later unassigned document at or above `threshold`.
pub fn find_duplicates(
    documents: &[(String, String)],
    threshold: f64,
    total: u64,
    sampled: bool,
    budget: &StageBudget,
) -> DuplicateAnalysis {
    let tokens: Vec<HashSet<String>> = documents.iter().map(|(_, c)| token_set(c)).collect();
    let mut assigned = vec![false; documents.len()];
    let mut groups = Vec::new();
    let mut pairs_compared = 0u64;
    let mut budget_exhausted = false;

    for i in 0..documents.len() {
        if budget.exhausted() {
            budget_exhausted = true;
            break;
        }
        if assigned[i] {
            continue;
        }

        let mut members = Vec::new();
        let mut lowest = 1.0f64;
        for j in (i + 1)..documents.len() {
            if assigned[j] {
                continue;
            }
            pairs_compared += 1;
            let similarity = jaccard(&tokens[i], &tokens[j]);
            if similarity >= threshold {
                assigned[j] = true;
                lowest = lowest.min(similarity);
                members.push(member(&documents[j], similarity));
            }
        }

        if !members.is_empty() {
            assigned[i] = true;
            members.insert(0, member(&documents[i], 1.0));
            groups.push(DuplicateGroup {
                anchor_id: documents[i].0.clone(),
                members,
                similarity: lowest,
            });
        }
    }

    let duplicate_count = groups.iter().map(|g| g.members.len() - 1).sum();
    let status = if duplicate_count == 0 {
        HealthStatus::Healthy
    } else {
        HealthStatus::Warning
    };

    DuplicateAnalysis {
        outcome: StageOutcome {
            status,
            sampled,
            budget_exhausted,
            ..StageOutcome::default()
        },
        groups,
        duplicate_count,
        pairs_compared,
        sample_size: documents.len(),
        total,
        threshold,
    }
}

fn member((id, content): &(String, String), similarity: f64) -> DuplicateMember {
    DuplicateMember {
        id: id.clone(),
        preview: truncate_preview(&content.replace('\n', " "), PREVIEW_CHARS),
        similarity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, content: &str) -> (String, String) {
        (id.to_string(), content.to_string())
    }

    #[test]
    fn jaccard_basics() {
        let a = token_set("the quick brown fox");
        let b = token_set("The quick brown fox!");
        let c = token_set("lazy dog");
        assert_eq!(jaccard(&a, &b), 1.0);
        assert_eq!(jaccard(&a, &c), 0.0);
        assert_eq!(jaccard(&HashSet::new(), &HashSet::new()), 1.0);
    }

    #[test]
    fn near_duplicates_group_and_unrelated_stays_out() {
        let docs = vec![
            doc("a", "use the connection pool for every database query in the api layer handler code"),
            doc("b", "use the connection pool for every database query in the api layer handler"),
            doc("c", "watercolor painting class meets on thursday evenings downtown"),
        ];
        let analysis = find_duplicates(&docs, 0.85, 3, false, &StageBudget::unlimited());

        assert_eq!(analysis.groups.len(), 1);
        let group = &analysis.groups[0];
        assert_eq!(group.ids(), vec!["a".to_string(), "b".to_string()]);
        assert!(group.similarity >= 0.85);
        assert_eq!(analysis.duplicate_count, 1);
        assert_eq!(analysis.outcome.status, HealthStatus::Warning);
        assert!(!analysis.outcome.sampled);
    }

    #[test]
    fn no_duplicates_is_healthy() {
        let docs = vec![doc("a", "alpha beta"), doc("b", "gamma delta")];
        let analysis = find_duplicates(&docs, 0.85, 2, false, &StageBudget::unlimited());
        assert!(analysis.groups.is_empty());
        assert_eq!(analysis.pairs_compared, 1);
        assert_eq!(analysis.outcome.status, HealthStatus::Healthy);
    }

    #[test]
    fn sampling_is_reported() {
        let docs = vec![doc("a", "alpha"), doc("b", "beta")];
        let analysis = find_duplicates(&docs, 0.85, 500, true, &StageBudget::unlimited());
        assert!(analysis.outcome.sampled);
        assert_eq!(analysis.sample_size, 2);
        assert_eq!(analysis.total, 500);
    }
}
