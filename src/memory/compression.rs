//! Token-budget compression.
//!
//! [`CompressionEngine::compress`] leaves text that already fits untouched.
//! Otherwise it keeps the high-signal lines (declarations, comment markers,
//! security terms) plus a window of neighbors, and if that is still too long
//! it binary-searches the longest character prefix that fits and appends a
//! truncation marker.

use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;

use crate::config::CompressionConfig;

/// Counts tokens. Must never fail; fall back to [`estimate_tokens`].
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Character-length estimate. Used when no tokenizer is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct EstimateCounter;

impl TokenCounter for EstimateCounter {
    fn count(&self, text: &str) -> usize {
        estimate_tokens(text)
    }
}

/// Exact counts from a HuggingFace tokenizer.
pub struct TokenizerCounter {
    tokenizer: Tokenizer,
}

impl TokenizerCounter {
    pub fn new(tokenizer: Tokenizer) -> Self {
        Self { tokenizer }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let mut tokenizer = crate::embedding::local::load_tokenizer(path)?;
        // Counting wants the full length, not the model's input window
        tokenizer
            .with_truncation(None)
            .map_err(|e| anyhow::anyhow!("failed to disable truncation: {e}"))?;
        tokenizer.with_padding(None);
        Ok(Self::new(tokenizer))
    }
}

impl TokenCounter for TokenizerCounter {
    fn count(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.get_ids().len(),
            Err(e) => {
                tracing::debug!(error = %e, "tokenizer failed, estimating token count");
                estimate_tokens(text)
            }
        }
    }
}

/// Outcome of [`CompressionEngine::compress`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionResult {
    pub compressed: String,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    /// `compressed_tokens / original_tokens`; 1.0 when nothing changed.
    pub compression_ratio: f64,
    /// Smart filtering dropped lines.
    pub filtered: bool,
    /// A prefix was cut and the truncation marker appended.
    pub truncated: bool,
}

// ── Line classification ───────────────────────────────────────────────────────

/// Lowercase substrings that make a line worth keeping.
const SIGNAL_TERMS: &[&str] = &[
    "fn ", "function ", "class ", "struct ", "enum ", "trait ", "impl ", "interface ", "def ",
    "return ", "export ", "import ", "async ", "const ", "todo", "fixme", "important", "note:",
    "warning", "hack", "deprecated", "password", "secret", "token", "api key", "api_key",
    "credential", "private key", "auth",
];

/// Line prefixes (after indentation) that mark comments or headers.
const COMMENT_MARKERS: &[&str] = &["//", "/*", "#", "--", "<!--", "\"\"\"", "* "];

const DECLARATION_KEYWORDS: &[&str] = &[
    "fn ", "function ", "class ", "struct ", "enum ", "trait ", "impl ", "interface ", "def ",
    "type ", "mod ",
];
const DECLARATION_MODIFIERS: &[&str] = &["pub ", "pub(crate) ", "export ", "async ", "default "];
const ATTENTION_MARKERS: &[&str] = &["TODO", "IMPORTANT", "FIXME", "NOTE"];

fn is_signal_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.is_empty() {
        return false;
    }
    if COMMENT_MARKERS.iter().any(|m| trimmed.starts_with(m)) {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    SIGNAL_TERMS.iter().any(|term| lowered.contains(term))
}

fn is_header(trimmed: &str) -> bool {
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes) && trimmed[hashes..].starts_with(' ')
}

fn is_declaration(trimmed: &str) -> bool {
    let mut rest = trimmed;
    while let Some(stripped) = DECLARATION_MODIFIERS.iter().find_map(|m| rest.strip_prefix(m)) {
        rest = stripped;
    }
    DECLARATION_KEYWORDS.iter().any(|k| rest.starts_with(k))
}

/// Summary priority of a line: headers 3, declarations 2, attention markers 1.
fn summary_weight(line: &str) -> Option<u8> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        None
    } else if is_header(trimmed) {
        Some(3)
    } else if is_declaration(trimmed) {
        Some(2)
    } else if ATTENTION_MARKERS.iter().any(|m| trimmed.contains(m)) {
        Some(1)
    } else {
        None
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CompressionEngine {
    counter: Arc<dyn TokenCounter>,
    config: CompressionConfig,
}

impl CompressionEngine {
    pub fn new(counter: Arc<dyn TokenCounter>, config: CompressionConfig) -> Self {
        Self { counter, config }
    }

    /// Engine using the `ceil(chars / 4)` estimate.
    pub fn with_estimator(config: CompressionConfig) -> Self {
        Self::new(Arc::new(EstimateCounter), config)
    }

    /// Engine using `tokenizer.json` from the model cache when present.
    pub fn from_model_cache(cache_dir: &Path, config: CompressionConfig) -> Self {
        let path = cache_dir.join("tokenizer.json");
        if path.exists() {
            match TokenizerCounter::from_file(&path) {
                Ok(counter) => {
                    tracing::debug!(tokenizer = %path.display(), "exact token counting enabled");
                    return Self::new(Arc::new(counter), config);
                }
                Err(e) => tracing::warn!(error = %e, "tokenizer unavailable, estimating tokens"),
            }
        }
        Self::with_estimator(config)
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    /// Fit `text` into `max_tokens`.
    ///
    /// The result never exceeds `max_tokens`, except by the marker's own
    /// token count when the budget is smaller than the marker.
    pub fn compress(&self, text: &str, max_tokens: usize, context_window: usize) -> CompressionResult {
        let original_tokens = self.count_tokens(text);
        if original_tokens <= max_tokens {
            return CompressionResult {
                compressed: text.to_string(),
                original_tokens,
                compressed_tokens: original_tokens,
                compression_ratio: 1.0,
                filtered: false,
                truncated: false,
            };
        }

        let (candidate, filtered) = match smart_filter(text, context_window) {
            Some(kept) => (kept, true),
            None => (text.to_string(), false),
        };

        let candidate_tokens = self.count_tokens(&candidate);
        let (compressed, compressed_tokens, truncated) = if candidate_tokens <= max_tokens {
            (candidate, candidate_tokens, false)
        } else {
            let budget = max_tokens.saturating_sub(self.count_tokens(&self.config.truncation_marker));
            let mut out = self.longest_prefix(&candidate, budget);
            out.push_str(&self.config.truncation_marker);
            let tokens = self.count_tokens(&out);
            (out, tokens, true)
        };

        tracing::debug!(
            original_tokens,
            compressed_tokens,
            filtered,
            truncated,
            "text compressed"
        );

        CompressionResult {
            compressed,
            original_tokens,
            compressed_tokens,
            compression_ratio: compressed_tokens as f64 / original_tokens as f64,
            filtered,
            truncated,
        }
    }

    /// Greedy priority summary within `max_tokens`.
    ///
    /// Headers beat declarations, which beat TODO/IMPORTANT/FIXME/NOTE lines.
    /// Selected lines keep their original order. Falls back to the first
    /// `summary_fallback_lines` lines when nothing matches.
    pub fn extract_summary(&self, text: &str, max_tokens: usize) -> String {
        let lines: Vec<&str> = text.lines().collect();

        let mut ranked: Vec<(u8, usize)> = lines
            .iter()
            .enumerate()
            .filter_map(|(i, line)| summary_weight(line).map(|w| (w, i)))
            .collect();

        if ranked.is_empty() {
            ranked = lines
                .iter()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .take(self.config.summary_fallback_lines)
                .map(|(i, _)| (0, i))
                .collect();
        } else {
            // Stable: equal weights keep document order
            ranked.sort_by(|a, b| b.0.cmp(&a.0));
        }

        let mut selected: BTreeSet<usize> = BTreeSet::new();
        for (_, idx) in &ranked {
            selected.insert(*idx);
            let summary = join_lines(&lines, &selected);
            if self.count_tokens(&summary) > max_tokens {
                selected.remove(idx);
                break;
            }
        }

        if selected.is_empty() {
            // Not even the best line fits whole
            return match ranked.first() {
                Some((_, idx)) => self.longest_prefix(lines[*idx], max_tokens),
                None => String::new(),
            };
        }
        join_lines(&lines, &selected)
    }

    /// Longest character prefix of `text` whose token count fits `budget`.
    fn longest_prefix(&self, text: &str, budget: usize) -> String {
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();

        // boundaries[n] is the byte offset after n chars
        let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if self.count_tokens(&text[..boundaries[mid]]) <= budget {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        text[..boundaries[lo]].to_string()
    }
}

/// Keep signal lines and `window` neighbors on each side.
///
/// Returns `None` when no line carries signal or every line would be kept.
fn smart_filter(text: &str, window: usize) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let mut keep = vec![false; lines.len()];
    let mut any_signal = false;

    for (i, line) in lines.iter().enumerate() {
        if is_signal_line(line) {
            any_signal = true;
            let start = i.saturating_sub(window);
            let end = (i + window).min(lines.len() - 1);
            keep[start..=end].iter_mut().for_each(|k| *k = true);
        }
    }

    if !any_signal || keep.iter().all(|k| *k) {
        return None;
    }

    let mut out: Vec<&str> = Vec::new();
    let mut previous: Option<usize> = None;
    for (i, line) in lines.iter().enumerate().filter(|(i, _)| keep[*i]) {
        if let Some(prev) = previous {
            // Mark the elided gap with one blank line
            if i > prev + 1 && out.last().is_some_and(|l| !l.trim().is_empty()) {
                out.push("");
            }
        }
        out.push(line);
        previous = Some(i);
    }
    Some(out.join("\n"))
}

fn join_lines(lines: &[&str], selected: &BTreeSet<usize>) -> String {
    selected
        .iter()
        .map(|i| lines[*i])
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CompressionEngine {
        CompressionEngine::with_estimator(CompressionConfig::default())
    }

    fn sample_source() -> String {
        let mut lines = Vec::new();
        for i in 0..40 {
            lines.push(format!("    let value_{i} = compute_something_longer({i}) + offset;"));
            if i % 10 == 0 {
                lines.push(format!("    // TODO: revisit block {i}"));
            }
        }
        lines.join("\n")
    }

    #[test]
    fn estimate_is_ceil_quarter_length() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn text_within_budget_is_unchanged() {
        let text = "fn main() {}\n";
        let result = engine().compress(text, 100, 2);
        assert_eq!(result.compressed, text);
        assert_eq!(result.compression_ratio, 1.0);
        assert!(!result.truncated && !result.filtered);
    }

    #[test]
    fn smart_filter_keeps_signal_lines_and_window() {
        let text = sample_source();
        let e = engine();
        let original = e.count_tokens(&text);
        let result = e.compress(&text, original / 2, 1);

        assert!(result.filtered);
        assert!(!result.truncated, "filtered text should already fit");
        assert!(result.compressed.contains("// TODO: revisit block 20"));
        assert!(result.compressed.contains("let value_20 "));
        assert!(result.compressed.contains("let value_21 "));
        assert!(!result.compressed.contains("let value_25 "));
        assert!(result.compression_ratio < 1.0);
    }

    #[test]
    fn filter_preserves_line_order() {
        let result = engine().compress(&sample_source(), 150, 0);
        let kept: Vec<&str> = result
            .compressed
            .lines()
            .filter(|l| l.contains("TODO"))
            .collect();
        let mut sorted = kept.clone();
        sorted.sort_by_key(|l| {
            l.trim_start_matches(|c: char| !c.is_ascii_digit())
                .parse::<u32>()
                .unwrap_or(0)
        });
        assert_eq!(kept, sorted);
    }

    #[test]
    fn truncation_respects_budget_plus_marker() {
        let e = engine();
        let text = "plain words without any signal ".repeat(200);
        for max in [0usize, 1, 5, 10, 50, 300] {
            let result = e.compress(&text, max, 2);
            let marker_tokens = e.count_tokens(&e.config().truncation_marker);
            assert!(result.truncated);
            assert!(
                e.count_tokens(&result.compressed) <= max.max(marker_tokens),
                "budget {max}: got {}",
                result.compressed_tokens
            );
            assert!(result.compressed.ends_with("[truncated]"));
        }
    }

    #[test]
    fn truncation_cuts_on_char_boundaries() {
        let e = engine();
        let text = "héllo wörld ünïcode ".repeat(50);
        let result = e.compress(&text, 20, 0);
        assert!(result.truncated);
        assert!(result.compressed.is_char_boundary(result.compressed.len()));
    }

    #[test]
    fn summary_prefers_headers_then_declarations() {
        let text = "intro prose\n# Overview\nsome text\nfn parse() {}\n// TODO: tighten\nmore prose";
        let e = engine();
        let summary = e.extract_summary(text, 1000);
        assert_eq!(summary, "# Overview\nfn parse() {}\n// TODO: tighten");

        // Tight budget keeps only the header
        let tight = e.extract_summary(text, e.count_tokens("# Overview"));
        assert_eq!(tight, "# Overview");
    }

    #[test]
    fn summary_falls_back_to_leading_lines() {
        let config = CompressionConfig {
            summary_fallback_lines: 2,
            ..Default::default()
        };
        let e = CompressionEngine::with_estimator(config);
        let summary = e.extract_summary("first line\nsecond line\nthird line", 1000);
        assert_eq!(summary, "first line\nsecond line");
    }

    #[test]
    fn oversized_single_line_summary_is_cut() {
        let e = engine();
        let text = format!("# {}", "x".repeat(400));
        let summary = e.extract_summary(&text, 10);
        assert!(e.count_tokens(&summary) <= 10);
        assert!(summary.starts_with("# "));
    }

    #[test]
    fn missing_tokenizer_falls_back_to_estimate() {
        let dir = tempfile::tempdir().unwrap();
        let e = CompressionEngine::from_model_cache(dir.path(), CompressionConfig::default());
        assert_eq!(e.count_tokens("abcdefgh"), 2);
    }
}
