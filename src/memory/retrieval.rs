//! Retrieval Coordinator: the single read entry point.
//!
//! Three modes over the two backends:
//!
//! - **exact**: relational index lookup (FTS5 keywords, context or metadata equality)
//! - **semantic**: embed the query, k-nearest neighbors from the vector backend
//! - **hybrid**: union of both candidate sets, blended relevance
//!   `w * exact + (1 - w) * semantic`, re-ranked with the full multi-factor score
//!
//! Lookups are by identity, never by tier, so a memory mid-migration is still
//! found. Every public read touches each returned memory exactly once;
//! [`RetrievalCoordinator::probe`] is the non-tracking variant for diagnostics.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{Backends, ExactField, ExactQuery, RelationalStore, VectorStore};
use crate::config::{RetrievalConfig, ScoringWeights};
use crate::embedding::EmbeddingProvider;
use crate::error::{BackendKind, MemoryError, Result};
use crate::memory::compression::CompressionEngine;
use crate::memory::scoring::{similarity_to_relevance, Candidate, ScoredMemory, ScoringEngine};
use crate::memory::tiered::TieredStore;
use crate::memory::types::Memory;

/// Per-query knobs for [`RetrievalCoordinator::search_hybrid`].
#[derive(Debug, Clone, PartialEq)]
pub struct HybridOptions {
    /// Weight of the exact-match indicator, in `[0, 1]`.
    pub exact_weight: f64,
    pub limit: usize,
    /// Overrides the configured scoring weights for this query.
    pub weights: Option<ScoringWeights>,
}

impl HybridOptions {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            exact_weight: config.hybrid_exact_weight,
            limit: config.default_limit,
            weights: None,
        }
    }
}

/// Hybrid results squeezed into a token budget.
#[derive(Debug, Clone, Serialize)]
pub struct CompressedContext {
    pub text: String,
    pub memory_count: usize,
    pub token_count: usize,
    pub original_tokens: usize,
    /// `token_count / original_tokens`; 1.0 for an empty result.
    pub compression_ratio: f64,
    pub truncated: bool,
    pub memory_ids: Vec<String>,
}

pub struct RetrievalCoordinator {
    store: Arc<TieredStore>,
    relational: Arc<dyn RelationalStore>,
    vector: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    scoring: ScoringEngine,
    compression: CompressionEngine,
    config: RetrievalConfig,
}

impl RetrievalCoordinator {
    pub fn new(
        store: Arc<TieredStore>,
        backends: Backends,
        scoring: ScoringEngine,
        compression: CompressionEngine,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            relational: backends.relational,
            vector: backends.vector,
            embedder: backends.embedder,
            scoring,
            compression,
            config,
        }
    }

    pub fn default_options(&self) -> HybridOptions {
        HybridOptions::from_config(&self.config)
    }

    pub fn compression(&self) -> &CompressionEngine {
        &self.compression
    }

    /// Identity read. Touches the memory when found.
    pub fn get(&self, id: &str) -> Result<Option<Memory>> {
        let memory = self.store.get(id)?;
        if memory.is_some() {
            self.store.touch(id);
        }
        Ok(memory)
    }

    /// Exact match on `field` (content keywords by default), default limit.
    pub fn search_exact(&self, query: &str, field: Option<ExactField>) -> Result<Vec<Memory>> {
        self.search_exact_with(&ExactQuery {
            text: query.to_string(),
            field: field.unwrap_or(ExactField::Content),
            limit: self.config.default_limit,
        })
    }

    pub fn search_exact_with(&self, query: &ExactQuery) -> Result<Vec<Memory>> {
        require_query(&query.text)?;
        let results = self.exact_candidates(query)?;
        self.touch_all(&results);
        Ok(results)
    }

    /// `k` nearest memories to the query, most similar first.
    pub fn search_semantic(&self, query: &str, k: usize) -> Result<Vec<Memory>> {
        require_query(query)?;
        let results: Vec<Memory> = self
            .semantic_candidates(query, k)?
            .into_iter()
            .map(|(memory, _)| memory)
            .collect();
        self.touch_all(&results);
        Ok(results)
    }

    /// Union of exact and semantic candidates, ranked by the multi-factor score.
    pub fn search_hybrid(&self, query: &str, options: &HybridOptions) -> Result<Vec<ScoredMemory>> {
        let results = self.rank_hybrid(query, options)?;
        let memories: Vec<Memory> = results.iter().map(|s| s.memory.clone()).collect();
        self.touch_all(&memories);
        Ok(results)
    }

    /// Hybrid search with default options that leaves access statistics alone.
    pub fn probe(&self, query: &str) -> Result<Vec<ScoredMemory>> {
        self.rank_hybrid(query, &self.default_options())
    }

    /// Hybrid results concatenated and compressed into `max_tokens`.
    ///
    /// Memories in tiers with `compression_enabled` contribute a summary
    /// instead of their full content.
    pub fn get_compressed_context(&self, query: &str, max_tokens: usize) -> Result<CompressedContext> {
        let results = self.search_hybrid(query, &self.default_options())?;
        if results.is_empty() {
            return Ok(CompressedContext {
                text: String::new(),
                memory_count: 0,
                token_count: 0,
                original_tokens: 0,
                compression_ratio: 1.0,
                truncated: false,
                memory_ids: Vec::new(),
            });
        }

        let summary_budget = self.compression.config().per_memory_summary_tokens;
        let mut full = Vec::with_capacity(results.len());
        let mut blocks = Vec::with_capacity(results.len());
        for scored in &results {
            let memory = &scored.memory;
            let header = format!("[{} | {}]", memory.tier, memory.context);
            full.push(format!("{header}\n{}", memory.content));

            let body = if self.store.tiers().get(memory.tier).compression_enabled {
                self.compression.extract_summary(&memory.content, summary_budget)
            } else {
                memory.content.clone()
            };
            blocks.push(format!("{header}\n{body}"));
        }

        let original_tokens = self.compression.count_tokens(&full.join("\n\n"));
        let result = self.compression.compress(
            &blocks.join("\n\n"),
            max_tokens,
            self.compression.config().context_window,
        );
        let compression_ratio = if original_tokens == 0 {
            1.0
        } else {
            result.compressed_tokens as f64 / original_tokens as f64
        };

        tracing::debug!(
            memories = results.len(),
            original_tokens,
            compressed_tokens = result.compressed_tokens,
            "compressed context assembled"
        );

        Ok(CompressedContext {
            text: result.compressed,
            memory_count: results.len(),
            token_count: result.compressed_tokens,
            original_tokens,
            compression_ratio,
            truncated: result.truncated,
            memory_ids: results.into_iter().map(|s| s.memory.id).collect(),
        })
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn rank_hybrid(&self, query: &str, options: &HybridOptions) -> Result<Vec<ScoredMemory>> {
        require_query(query)?;
        if !(0.0..=1.0).contains(&options.exact_weight) {
            return Err(MemoryError::validation(format!(
                "exact_weight must be within [0, 1], got {}",
                options.exact_weight
            )));
        }
        if options.limit == 0 {
            return Ok(Vec::new());
        }

        let fetch = options.limit.saturating_mul(self.config.candidate_multiplier);
        let exact = self.exact_candidates(&ExactQuery::content(query, fetch))?;
        let semantic = self.semantic_candidates(query, fetch)?;

        // Union by identity; exact-only memories have no semantic evidence
        let mut merged: HashMap<String, (Memory, bool, f64)> = HashMap::new();
        for memory in exact {
            merged.insert(memory.id.clone(), (memory, true, 0.0));
        }
        for (memory, similarity) in semantic {
            merged
                .entry(memory.id.clone())
                .and_modify(|entry| entry.2 = similarity)
                .or_insert((memory, false, similarity));
        }

        let w = options.exact_weight;
        let candidates: Vec<Candidate> = merged
            .into_values()
            .map(|(memory, exact_match, similarity)| {
                let indicator = if exact_match { 1.0 } else { 0.0 };
                Candidate {
                    memory,
                    relevance: w * indicator + (1.0 - w) * similarity_to_relevance(similarity),
                    exact_match,
                }
            })
            .collect();

        let mut ranked = self
            .scoring
            .rank(candidates, options.weights.as_ref(), Utc::now());
        ranked.truncate(options.limit);
        Ok(ranked)
    }

    fn exact_candidates(&self, query: &ExactQuery) -> Result<Vec<Memory>> {
        self.store
            .retry_policy()
            .run(BackendKind::Relational, "exact_search", || {
                self.relational.exact_search(query)
            })
    }

    /// Nearest neighbors joined to their canonical rows, with cosine similarity.
    fn semantic_candidates(&self, query: &str, k: usize) -> Result<Vec<(Memory, f64)>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let vector = self
            .embedder
            .embed(query)
            .map_err(|e| MemoryError::Embedding(format!("{e:#}")))?;
        let hits = self
            .store
            .retry_policy()
            .run(BackendKind::Vector, "query", || self.vector.query(&vector, None, k))?;

        let ids: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
        let mut rows: HashMap<String, Memory> = self
            .store
            .get_many(&ids)?
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();

        Ok(hits
            .into_iter()
            .filter_map(|hit| match rows.remove(&hit.id) {
                Some(memory) => Some((memory, hit.similarity)),
                None => {
                    // Vector copy without a canonical row: a partial write awaiting repair
                    tracing::debug!(id = %hit.id, "vector hit has no relational row, skipping");
                    None
                }
            })
            .collect())
    }

    fn touch_all(&self, memories: &[Memory]) {
        for memory in memories {
            self.store.touch(&memory.id);
        }
    }
}

fn require_query(query: &str) -> Result<()> {
    if query.trim().is_empty() {
        Err(MemoryError::validation("query must not be empty"))
    } else {
        Ok(())
    }
}
