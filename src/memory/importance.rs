//! Deterministic importance heuristic and initial tier placement.

use std::collections::HashSet;

use crate::config::{ImportanceConfig, TiersConfig};
use crate::memory::types::{MemoryContext, Tier};

/// Below this many words the redundancy penalty is not applied.
const MIN_WORDS_FOR_REDUNDANCY: usize = 10;

/// Score content in `[0.0, 1.0]`.
///
/// Starts from `base`, adds the context bonus and the boost of every signal
/// group with at least one matching keyword, then subtracts the length and
/// redundancy penalties.
pub fn score_importance(content: &str, context: MemoryContext, config: &ImportanceConfig) -> f64 {
    let lowered = content.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .collect();
    let word_set: HashSet<&str> = words.iter().copied().collect();

    let mut score = config.base + config.context_bonus(context);

    for signal in &config.signals {
        let hit = signal.keywords.iter().any(|keyword| {
            let keyword = keyword.to_lowercase();
            if keyword.contains(char::is_whitespace) {
                lowered.contains(&keyword)
            } else {
                word_set.contains(keyword.as_str())
            }
        });
        if hit {
            score += signal.boost;
        }
    }

    let chars = content.chars().count();
    if chars < config.short_content_chars || chars > config.long_content_chars {
        score -= config.length_penalty;
    }

    if words.len() >= MIN_WORDS_FOR_REDUNDANCY {
        let unique_ratio = word_set.len() as f64 / words.len() as f64;
        if unique_ratio < config.redundancy_ratio {
            score -= config.redundancy_penalty;
        }
    }

    score.clamp(0.0, 1.0)
}

/// Tier a freshly stored memory starts in.
pub fn initial_tier(importance: f64, tiers: &TiersConfig) -> Tier {
    if importance >= tiers.promote_on_store_importance {
        Tier::LongTerm
    } else {
        Tier::Working
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ImportanceConfig {
        ImportanceConfig::default()
    }

    #[test]
    fn plain_code_snippet_scores_near_base() {
        let score = score_importance(
            "function calculateTotal(items) {...}",
            MemoryContext::CodeSnippet,
            &config(),
        );
        assert!((score - 0.45).abs() < 1e-9, "got {score}");
    }

    #[test]
    fn keyword_signals_raise_importance() {
        let plain = score_importance(
            "the deploy script lives in the ops folder",
            MemoryContext::General,
            &config(),
        );
        let flagged = score_importance(
            "TODO: rotate the api key stored in the ops folder",
            MemoryContext::General,
            &config(),
        );
        assert!(flagged > plain);
        // todo (+0.1) and api key (+0.25)
        assert!((flagged - plain - 0.35).abs() < 1e-9);
    }

    #[test]
    fn each_signal_group_counts_once() {
        let once = score_importance("bug in the parser module", MemoryContext::General, &config());
        let twice = score_importance(
            "bug bug hack fixme in the parser module",
            MemoryContext::General,
            &config(),
        );
        assert!((once - twice).abs() < 1e-9);
    }

    #[test]
    fn short_and_redundant_content_is_penalized() {
        let short = score_importance("ok", MemoryContext::General, &config());
        assert!((short - 0.3).abs() < 1e-9);

        let redundant = "same ".repeat(40);
        let score = score_importance(&redundant, MemoryContext::General, &config());
        assert!((score - 0.25).abs() < 1e-9, "got {score}");
    }

    #[test]
    fn score_is_clamped() {
        let loud = "critical password secret TODO decision never always must";
        let score = score_importance(loud, MemoryContext::CriticalTask, &config());
        assert_eq!(score, 1.0);
    }

    #[test]
    fn high_importance_starts_in_long_term() {
        let tiers = TiersConfig::default();
        assert_eq!(initial_tier(0.9, &tiers), Tier::LongTerm);
        assert_eq!(initial_tier(0.85, &tiers), Tier::LongTerm);
        assert_eq!(initial_tier(0.84, &tiers), Tier::Working);
    }
}
