//! Tiered Store: canonical placement of every memory across
//! `working -> session -> long_term`.
//!
//! Writes go to both backends. The relational backend is the source of truth
//! for tier and access statistics; the vector backend mirrors the tier in its
//! metadata so filtered similarity queries can target one tier.
//!
//! Migration is copy-then-retire: the destination placement is written to the
//! vector backend first, then the relational tier is switched with a
//! compare-and-set on the source tier. A memory is therefore readable by id at
//! every point of a migration, and a step can only ever move it forward.

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    vector_metadata, Backends, ListFilter, ListOrder, RelationalStore, RetryPolicy, StoreStats,
    VectorStore,
};
use crate::config::{ImportanceConfig, TierMemConfig, TiersConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{BackendKind, MemoryError, Result};
use crate::memory::importance::{initial_tier, score_importance};
use crate::memory::metadata::sanitize_metadata;
use crate::memory::types::{Memory, MemoryContext, Tier};

/// Upper bound on memory content, in characters.
pub const MAX_CONTENT_CHARS: usize = 100_000;

#[derive(Debug, Clone)]
pub struct TieredStoreConfig {
    pub tiers: TiersConfig,
    pub importance: ImportanceConfig,
    pub retry: RetryPolicy,
    /// Rows per `upsert_many` call in [`TieredStore::bulk_index`].
    pub bulk_batch_size: usize,
}

impl Default for TieredStoreConfig {
    fn default() -> Self {
        Self::from_config(&TierMemConfig::default())
    }
}

impl TieredStoreConfig {
    pub fn from_config(config: &TierMemConfig) -> Self {
        Self {
            tiers: config.tiers.clone(),
            importance: config.importance.clone(),
            retry: RetryPolicy::from_config(&config.retry),
            bulk_batch_size: config.storage.bulk_batch_size.max(1),
        }
    }
}

// ── Reports ───────────────────────────────────────────────────────────────────

/// One item a batch operation could not process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFailure {
    pub id: String,
    /// Backend that rejected the item; `None` for validation and embedding failures.
    pub backend: Option<BackendKind>,
    pub message: String,
}

impl ItemFailure {
    fn new(id: impl Into<String>, backend: Option<BackendKind>, message: impl ToString) -> Self {
        Self {
            id: id.into(),
            backend,
            message: message.to_string(),
        }
    }

    fn from_error(id: impl Into<String>, err: &MemoryError) -> Self {
        Self::new(id, err.backend(), err)
    }
}

/// A memory that failed to migrate. Recorded, never raised.
pub type MigrationItemFailure = ItemFailure;

/// Migration outcome for one source/destination pair.
#[derive(Debug, Clone, Serialize)]
pub struct TierMigration {
    pub from: Tier,
    pub to: Tier,
    /// Memories selected for migration (aged out or over the cap).
    pub considered: usize,
    pub migrated: usize,
    pub failed: usize,
    /// How far the source tier was over `max_size` after the age pass.
    pub over_cap: usize,
    pub errors: Vec<MigrationItemFailure>,
}

impl TierMigration {
    fn new(from: Tier, to: Tier) -> Self {
        Self {
            from,
            to,
            considered: 0,
            migrated: 0,
            failed: 0,
            over_cap: 0,
            errors: Vec::new(),
        }
    }

    fn record_failure(&mut self, failure: MigrationItemFailure) {
        tracing::warn!(
            id = %failure.id,
            from = %self.from,
            to = %self.to,
            error = %failure.message,
            "memory migration failed"
        );
        self.failed += 1;
        self.errors.push(failure);
    }
}

/// Produced once per migration cycle.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<TierMigration>,
    /// Population of `long_term` when it exceeds its cap. Nothing migrates out of it.
    pub long_term_over_cap: Option<u64>,
    /// The cycle stopped early; `steps` holds the work done before that.
    pub cancelled: bool,
}

impl MigrationReport {
    pub fn total_considered(&self) -> usize {
        self.steps.iter().map(|s| s.considered).sum()
    }

    pub fn total_migrated(&self) -> usize {
        self.steps.iter().map(|s| s.migrated).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.steps.iter().map(|s| s.failed).sum()
    }

    pub fn step(&self, from: Tier) -> Option<&TierMigration> {
        self.steps.iter().find(|s| s.from == from)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkIndexReport {
    pub indexed: usize,
    pub failed: usize,
    pub batches: usize,
    pub errors: Vec<ItemFailure>,
    pub cancelled: bool,
}

impl BulkIndexReport {
    fn record_failure(&mut self, failure: ItemFailure) {
        self.failed += 1;
        self.errors.push(failure);
    }
}

/// Result of merging a duplicate group into one survivor.
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationOutcome {
    pub survivor: Memory,
    pub removed: Vec<String>,
    /// Requested ids that no longer exist.
    pub missing: Vec<String>,
    pub failures: Vec<ItemFailure>,
}

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct TieredStore {
    relational: Arc<dyn RelationalStore>,
    vector: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: TieredStoreConfig,
}

impl TieredStore {
    pub fn new(backends: Backends, config: TieredStoreConfig) -> Self {
        Self {
            relational: backends.relational,
            vector: backends.vector,
            embedder: backends.embedder,
            config,
        }
    }

    pub fn tiers(&self) -> &TiersConfig {
        &self.config.tiers
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.config.retry
    }

    /// Persist new content with the current time.
    pub fn store(
        &self,
        content: &str,
        context: MemoryContext,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Memory> {
        self.store_at(content, context, metadata, Utc::now())
    }

    /// Validate, score, place and write a new memory to both backends.
    ///
    /// Returns [`MemoryError::PartialWrite`] when exactly one backend accepted
    /// the write; the error carries the memory and names the backend to pass
    /// to [`Self::retry_write`].
    pub fn store_at(
        &self,
        content: &str,
        context: MemoryContext,
        metadata: &serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<Memory> {
        validate_content(content)?;
        let metadata = sanitize_metadata(metadata)?;
        // Stored timestamps carry millisecond precision
        let now = now.trunc_subsecs(3);

        let importance = score_importance(content, context, &self.config.importance);
        let memory = Memory {
            id: uuid::Uuid::now_v7().to_string(),
            content: content.to_string(),
            context,
            importance,
            tier: initial_tier(importance, &self.config.tiers),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            metadata,
        };

        let vector = self.embed(&memory.content)?;
        self.write_both(&memory, &vector)?;

        tracing::info!(
            id = %memory.id,
            context = %memory.context,
            tier = %memory.tier,
            importance = memory.importance,
            "memory stored"
        );
        Ok(memory)
    }

    /// Re-issue a write to the backend a [`MemoryError::PartialWrite`] named.
    pub fn retry_write(&self, memory: &Memory, backend: BackendKind) -> Result<()> {
        match backend {
            BackendKind::Relational => self.write_relational(memory),
            BackendKind::Vector => {
                let vector = self.embed(&memory.content)?;
                self.write_vector(memory, &vector)
            }
        }
    }

    /// Record a read. Best-effort: a failed update is logged and swallowed,
    /// and it is attempted once without retries.
    pub fn touch(&self, id: &str) {
        self.touch_at(id, Utc::now());
    }

    pub fn touch_at(&self, id: &str, now: DateTime<Utc>) {
        if let Err(e) = self.relational.record_access(id, now) {
            tracing::warn!(id, error = %e, "access tracking update dropped");
        }
    }

    /// Identity lookup, whichever tier the memory is in. Does not touch.
    pub fn get(&self, id: &str) -> Result<Option<Memory>> {
        self.config
            .retry
            .run(BackendKind::Relational, "get", || self.relational.get(id))
    }

    /// Fetch many by id, preserving order and skipping missing ids. Does not touch.
    pub fn get_many(&self, ids: &[String]) -> Result<Vec<Memory>> {
        self.config
            .retry
            .run(BackendKind::Relational, "get_many", || {
                self.relational.get_many(ids)
            })
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Memory>> {
        self.config
            .retry
            .run(BackendKind::Relational, "list", || self.relational.list(filter))
    }

    /// Remove a memory from both backends. Returns whether either held it.
    ///
    /// As with [`Self::store`], a one-sided failure is a
    /// [`MemoryError::PartialWrite`] whose `written` lists the backends the
    /// delete was applied to.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let relational = self
            .config
            .retry
            .run(BackendKind::Relational, "delete", || self.relational.delete(id));
        let vector = self
            .config
            .retry
            .run(BackendKind::Vector, "delete", || self.vector.delete(id));

        match (relational, vector) {
            (Ok(r), Ok(v)) => {
                if r || v {
                    tracing::info!(id, "memory deleted");
                }
                Ok(r || v)
            }
            (Ok(_), Err(e)) => Err(partial(id, None, BackendKind::Relational, BackendKind::Vector, e)),
            (Err(e), Ok(_)) => Err(partial(id, None, BackendKind::Vector, BackendKind::Relational, e)),
            (Err(e), Err(_)) => Err(e),
        }
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.config
            .retry
            .run(BackendKind::Relational, "stats", || self.relational.stats())
    }

    pub fn vector_count(&self) -> Result<u64> {
        self.config
            .retry
            .run(BackendKind::Vector, "count", || self.vector.count())
    }

    /// `(id, document)` pairs straight from the vector backend, up to `limit`.
    pub fn vector_documents(&self, limit: usize) -> Result<Vec<(String, String)>> {
        let documents = self
            .config
            .retry
            .run(BackendKind::Vector, "get_all", || {
                self.vector.get_all(None, Some(limit))
            })?;
        Ok(documents.into_iter().map(|d| (d.id, d.document)).collect())
    }

    // ── Migration ─────────────────────────────────────────────────────────

    pub fn migrate(&self, cancel: &CancellationToken) -> MigrationReport {
        self.migrate_at(Utc::now(), cancel)
    }

    /// Run one migration cycle as of `now`.
    ///
    /// `working` is processed before `session`, so memories cascade as far
    /// as they are eligible and a second cycle at the same instant moves
    /// nothing. Per-memory failures are recorded and the cycle continues.
    pub fn migrate_at(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> MigrationReport {
        let mut report = MigrationReport {
            started_at: now,
            finished_at: now,
            steps: Vec::new(),
            long_term_over_cap: None,
            cancelled: false,
        };

        for from in Tier::ALL {
            let Some(to) = from.next() else { continue };
            let mut step = TierMigration::new(from, to);
            let completed = self.migrate_tier(&mut step, now, cancel);
            report.steps.push(step);
            if !completed {
                report.cancelled = true;
                break;
            }
        }

        if !report.cancelled {
            report.long_term_over_cap = self.long_term_overflow();
        }
        report.finished_at = Utc::now();

        tracing::info!(
            considered = report.total_considered(),
            migrated = report.total_migrated(),
            failed = report.total_failed(),
            cancelled = report.cancelled,
            "migration cycle finished"
        );
        report
    }

    /// Returns `false` when cancelled mid-step.
    fn migrate_tier(
        &self,
        step: &mut TierMigration,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> bool {
        let tier_config = self.config.tiers.get(step.from);

        // Age pass
        let aged = ListFilter {
            tier: Some(step.from),
            created_before: Some(now - tier_config.retention()),
            order: ListOrder::CreatedAsc,
            limit: None,
        };
        match self.list(&aged) {
            Ok(candidates) => {
                for memory in candidates {
                    if cancel.is_cancelled() {
                        return false;
                    }
                    if !is_eligible(&memory, tier_config.importance_threshold, tier_config.min_access_count) {
                        continue;
                    }
                    step.considered += 1;
                    self.migrate_one(&memory, step);
                }
            }
            Err(e) => step.record_failure(ItemFailure::from_error(step.from.as_str(), &e)),
        }

        // Cap pass
        let population = match self
            .config
            .retry
            .run(BackendKind::Relational, "count_by_tier", || {
                self.relational.count_by_tier()
            }) {
            Ok(counts) => counts.get(&step.from).copied().unwrap_or(0) as usize,
            Err(e) => {
                step.record_failure(ItemFailure::from_error(step.from.as_str(), &e));
                return true;
            }
        };
        if population <= tier_config.max_size {
            return true;
        }

        step.over_cap = population - tier_config.max_size;
        tracing::info!(
            tier = %step.from,
            population,
            max_size = tier_config.max_size,
            "tier over capacity, evicting least recently accessed"
        );
        let evict = ListFilter {
            tier: Some(step.from),
            created_before: None,
            order: ListOrder::LeastRecentlyAccessed,
            limit: Some(step.over_cap),
        };
        match self.list(&evict) {
            Ok(victims) => {
                for memory in victims {
                    if cancel.is_cancelled() {
                        return false;
                    }
                    step.considered += 1;
                    self.migrate_one(&memory, step);
                }
            }
            Err(e) => step.record_failure(ItemFailure::from_error(step.from.as_str(), &e)),
        }
        true
    }

    /// Copy the new placement to the vector backend, then retire the old one.
    fn migrate_one(&self, memory: &Memory, step: &mut TierMigration) {
        let mut moved = memory.clone();
        moved.tier = step.to;

        let placed = self
            .config
            .retry
            .run(BackendKind::Vector, "update_metadata", || {
                self.vector.update_metadata(&memory.id, &vector_metadata(&moved))
            });
        match placed {
            Ok(true) => {}
            Ok(false) => {
                // No vector copy yet; write a full one
                let repaired = self
                    .embed(&moved.content)
                    .and_then(|vector| self.write_vector(&moved, &vector));
                if let Err(e) = repaired {
                    step.record_failure(ItemFailure::from_error(&memory.id, &e));
                    return;
                }
            }
            Err(e) => {
                step.record_failure(ItemFailure::from_error(&memory.id, &e));
                return;
            }
        }

        let switched = self
            .config
            .retry
            .run(BackendKind::Relational, "set_tier", || {
                self.relational.set_tier(&memory.id, step.from, step.to)
            });
        match switched {
            Ok(true) => {
                step.migrated += 1;
                tracing::debug!(id = %memory.id, from = %step.from, to = %step.to, "memory migrated");
            }
            Ok(false) => {
                tracing::debug!(id = %memory.id, "memory moved or deleted concurrently, skipping");
            }
            Err(e) => step.record_failure(ItemFailure::from_error(&memory.id, &e)),
        }
    }

    fn long_term_overflow(&self) -> Option<u64> {
        let cap = self.config.tiers.long_term.max_size as u64;
        let population = self
            .relational
            .count_by_tier()
            .ok()?
            .get(&Tier::LongTerm)
            .copied()
            .unwrap_or(0);
        if population > cap {
            tracing::warn!(population, cap, "long_term tier over capacity; nothing migrates out of it");
            Some(population)
        } else {
            None
        }
    }

    // ── Bulk indexing ─────────────────────────────────────────────────────

    /// Import pre-built memories in batches of `bulk_batch_size`.
    ///
    /// Each batch is one relational transaction; if it fails the batch is
    /// replayed row by row so only the offending memories are reported.
    /// Cancellation is checked between batches.
    pub fn bulk_index(&self, memories: Vec<Memory>, cancel: &CancellationToken) -> BulkIndexReport {
        let mut report = BulkIndexReport::default();

        let mut valid = Vec::with_capacity(memories.len());
        for memory in memories {
            match validate_content(&memory.content).and_then(|_| validate_importance(&memory)) {
                Ok(()) => valid.push(memory),
                Err(e) => report.record_failure(ItemFailure::from_error(&memory.id, &e)),
            }
        }

        for batch in valid.chunks(self.config.bulk_batch_size) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.batches += 1;

            let written = self.index_relational(batch, &mut report);
            if written.is_empty() {
                continue;
            }

            let texts: Vec<&str> = written.iter().map(|m| m.content.as_str()).collect();
            let vectors = match self.embedder.embed_batch(&texts) {
                Ok(vectors) if vectors.len() == written.len() => vectors,
                Ok(_) | Err(_) => {
                    // Fall back to one call per memory to isolate the failure
                    let mut vectors = Vec::with_capacity(written.len());
                    for memory in &written {
                        vectors.push(self.embed(&memory.content).ok());
                    }
                    self.index_vectors_isolated(&written, vectors, &mut report);
                    continue;
                }
            };
            self.index_vectors_isolated(&written, vectors.into_iter().map(Some).collect(), &mut report);
        }

        tracing::info!(
            indexed = report.indexed,
            failed = report.failed,
            batches = report.batches,
            cancelled = report.cancelled,
            "bulk index finished"
        );
        report
    }

    fn index_relational<'a>(&self, batch: &'a [Memory], report: &mut BulkIndexReport) -> Vec<&'a Memory> {
        let whole = self
            .config
            .retry
            .run(BackendKind::Relational, "upsert_many", || {
                self.relational.upsert_many(batch)
            });
        match whole {
            Ok(_) => batch.iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, rows = batch.len(), "batch write failed, retrying row by row");
                batch
                    .iter()
                    .filter(|memory| match self.write_relational(memory) {
                        Ok(()) => true,
                        Err(e) => {
                            report.record_failure(ItemFailure::from_error(&memory.id, &e));
                            false
                        }
                    })
                    .collect()
            }
        }
    }

    fn index_vectors_isolated(
        &self,
        memories: &[&Memory],
        vectors: Vec<Option<Vec<f32>>>,
        report: &mut BulkIndexReport,
    ) {
        for (memory, vector) in memories.iter().zip(vectors) {
            let Some(vector) = vector else {
                report.record_failure(ItemFailure::new(&memory.id, None, "embedding failed"));
                continue;
            };
            match self.write_vector(memory, &vector) {
                Ok(()) => report.indexed += 1,
                Err(e) => report.record_failure(ItemFailure::from_error(&memory.id, &e)),
            }
        }
    }

    // ── Consolidation ─────────────────────────────────────────────────────

    /// Merge a duplicate group into one survivor.
    ///
    /// The survivor is the member with the highest importance, then the most
    /// accesses, then the smallest id. It keeps the group's maximum
    /// importance, the summed access count and the latest access time; the
    /// other members are deleted.
    pub fn consolidate(&self, ids: &[String]) -> Result<ConsolidationOutcome> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = ids.iter().filter(|id| seen.insert(*id)).cloned().collect();
        if unique.len() < 2 {
            return Err(MemoryError::validation(
                "consolidation needs at least two distinct memory ids",
            ));
        }

        let members = self.get_many(&unique)?;
        let found: HashSet<&str> = members.iter().map(|m| m.id.as_str()).collect();
        let missing: Vec<String> = unique
            .iter()
            .filter(|id| !found.contains(id.as_str()))
            .cloned()
            .collect();

        let Some(survivor) = members.iter().max_by(|a, b| {
            a.importance
                .total_cmp(&b.importance)
                .then(a.access_count.cmp(&b.access_count))
                .then_with(|| b.id.cmp(&a.id))
        }) else {
            return Err(MemoryError::NotFound(unique.join(", ")));
        };

        // Merged in place: the survivor's current tier and any accesses
        // recorded since the read are kept.
        let others: Vec<&Memory> = members.iter().filter(|m| m.id != survivor.id).collect();
        let importance = others
            .iter()
            .fold(survivor.importance, |acc, m| acc.max(m.importance));
        let accesses = others
            .iter()
            .fold(0u32, |acc, m| acc.saturating_add(m.access_count));
        let last_accessed_at = others
            .iter()
            .fold(survivor.last_accessed_at, |acc, m| acc.max(m.last_accessed_at));
        let exists = self
            .config
            .retry
            .run(BackendKind::Relational, "merge_stats", || {
                self.relational
                    .merge_stats(&survivor.id, importance, accesses, last_accessed_at)
            })?;
        if !exists {
            return Err(MemoryError::NotFound(survivor.id.clone()));
        }
        let merged = self
            .get(&survivor.id)?
            .ok_or_else(|| MemoryError::NotFound(survivor.id.clone()))?;

        let mut removed = Vec::new();
        let mut failures = Vec::new();
        for other in others {
            match self.delete(&other.id) {
                Ok(_) => removed.push(other.id.clone()),
                Err(e) => failures.push(ItemFailure::from_error(&other.id, &e)),
            }
        }

        tracing::info!(
            survivor = %merged.id,
            removed = removed.len(),
            failed = failures.len(),
            "duplicates consolidated"
        );
        Ok(ConsolidationOutcome {
            survivor: merged,
            removed,
            missing,
            failures,
        })
    }

    /// Population per tier.
    pub fn count_by_tier(&self) -> Result<BTreeMap<Tier, u64>> {
        self.config
            .retry
            .run(BackendKind::Relational, "count_by_tier", || {
                self.relational.count_by_tier()
            })
    }

    // ── Write helpers ─────────────────────────────────────────────────────

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embedder
            .embed(text)
            .map_err(|e| MemoryError::Embedding(format!("{e:#}")))
    }

    fn write_relational(&self, memory: &Memory) -> Result<()> {
        self.config
            .retry
            .run(BackendKind::Relational, "upsert_memory", || {
                self.relational.upsert_memory(memory)
            })
    }

    fn write_vector(&self, memory: &Memory, vector: &[f32]) -> Result<()> {
        let metadata = vector_metadata(memory);
        self.config.retry.run(BackendKind::Vector, "upsert", || {
            self.vector
                .upsert(&memory.id, vector, &memory.content, &metadata)
        })
    }

    fn write_both(&self, memory: &Memory, vector: &[f32]) -> Result<()> {
        let relational = self.write_relational(memory);
        let vector = self.write_vector(memory, vector);

        match (relational, vector) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => Err(partial(
                &memory.id,
                Some(memory),
                BackendKind::Relational,
                BackendKind::Vector,
                e,
            )),
            (Err(e), Ok(())) => Err(partial(
                &memory.id,
                Some(memory),
                BackendKind::Vector,
                BackendKind::Relational,
                e,
            )),
            (Err(e), Err(_)) => Err(e),
        }
    }
}

fn partial(
    id: &str,
    memory: Option<&Memory>,
    written: BackendKind,
    failed: BackendKind,
    err: MemoryError,
) -> MemoryError {
    tracing::warn!(id, written = %written, failed = %failed, error = %err, "partial write");
    MemoryError::PartialWrite {
        memory_id: id.to_string(),
        memory: memory.map(|m| Box::new(m.clone())),
        written: vec![written],
        failed,
        message: err.to_string(),
    }
}

/// Aged memories migrate unless important enough, or accessed often enough, to stay.
fn is_eligible(memory: &Memory, importance_threshold: f64, min_access_count: u32) -> bool {
    memory.importance < importance_threshold || memory.access_count < min_access_count
}

fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(MemoryError::validation("content must not be empty"));
    }
    let chars = content.chars().count();
    if chars > MAX_CONTENT_CHARS {
        return Err(MemoryError::validation(format!(
            "content is {chars} characters, limit is {MAX_CONTENT_CHARS}"
        )));
    }
    Ok(())
}

fn validate_importance(memory: &Memory) -> Result<()> {
    if (0.0..=1.0).contains(&memory.importance) {
        Ok(())
    } else {
        Err(MemoryError::validation(format!(
            "importance must be within [0, 1], got {}",
            memory.importance
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SqliteRelationalStore, SqliteVectorStore, VectorFilter};
    use crate::embedding::hashed::HashedEmbeddingProvider;
    use chrono::Duration;

    const DIMS: usize = 16;

    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(3)
    }

    fn setup_with(config: TieredStoreConfig) -> (TieredStore, Arc<SqliteVectorStore>) {
        let vector = Arc::new(SqliteVectorStore::open_in_memory(DIMS).unwrap());
        let backends = Backends::new(
            Arc::new(SqliteRelationalStore::open_in_memory().unwrap()),
            vector.clone(),
            Arc::new(HashedEmbeddingProvider::new(DIMS)),
        );
        (TieredStore::new(backends, config), vector)
    }

    fn setup() -> (TieredStore, Arc<SqliteVectorStore>) {
        let config = TieredStoreConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        };
        setup_with(config)
    }

    fn no_meta() -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    fn store_note(store: &TieredStore, text: &str, at: DateTime<Utc>) -> Memory {
        store
            .store_at(text, MemoryContext::General, &no_meta(), at)
            .unwrap()
    }

    #[test]
    fn store_writes_both_backends() {
        let (store, vector) = setup();
        let mut meta = no_meta();
        meta.insert("tags".into(), serde_json::json!(["rust", "sql"]));

        let memory = store
            .store("function calculateTotal(items) {...}", MemoryContext::CodeSnippet, &meta)
            .unwrap();

        assert_eq!(memory.tier, Tier::Working);
        assert_eq!(memory.access_count, 0);
        assert_eq!(memory.metadata.get("tags_type").unwrap().as_index_text(), "array");
        assert_eq!(store.get(&memory.id).unwrap().unwrap(), memory);
        assert_eq!(vector.count().unwrap(), 1);
    }

    #[test]
    fn invalid_content_is_rejected_before_any_write() {
        let (store, vector) = setup();
        let empty = store.store("   ", MemoryContext::General, &no_meta());
        assert!(matches!(empty, Err(MemoryError::Validation(_))));

        let huge = "x".repeat(MAX_CONTENT_CHARS + 1);
        let oversized = store.store(&huge, MemoryContext::General, &no_meta());
        assert!(matches!(oversized, Err(MemoryError::Validation(_))));

        let mut meta = no_meta();
        meta.insert("memory_tier".into(), serde_json::json!("long_term"));
        let reserved = store.store("valid content here", MemoryContext::General, &meta);
        assert!(matches!(reserved, Err(MemoryError::Validation(_))));

        assert_eq!(store.stats().unwrap().total, 0);
        assert_eq!(vector.count().unwrap(), 0);
    }

    #[test]
    fn important_content_starts_in_long_term() {
        let (store, _) = setup();
        let memory = store
            .store(
                "IMPORTANT: never commit the password or api key to the repository",
                MemoryContext::CriticalTask,
                &no_meta(),
            )
            .unwrap();
        assert_eq!(memory.tier, Tier::LongTerm);
        assert!(memory.importance >= 0.85);
    }

    #[test]
    fn touch_tracks_access() {
        let (store, _) = setup();
        let t0 = now();
        let memory = store_note(&store, "lunch order preferences for the team", t0);

        store.touch_at(&memory.id, t0 + Duration::minutes(5));
        store.touch_at(&memory.id, t0 + Duration::minutes(9));
        // Unknown ids are ignored
        store.touch("does-not-exist");

        let reloaded = store.get(&memory.id).unwrap().unwrap();
        assert_eq!(reloaded.access_count, 2);
        assert_eq!(reloaded.last_accessed_at, t0 + Duration::minutes(9));
    }

    #[test]
    fn aged_memory_migrates_once() {
        let (store, vector) = setup();
        let t0 = now() - Duration::days(1);
        let memory = store_note(&store, "plain note about team lunch plans", t0);
        let now = t0 + Duration::hours(2);
        let cancel = CancellationToken::new();

        let first = store.migrate_at(now, &cancel);
        assert_eq!(first.total_migrated(), 1);
        assert_eq!(first.step(Tier::Working).unwrap().migrated, 1);
        assert_eq!(store.get(&memory.id).unwrap().unwrap().tier, Tier::Session);
        let in_session = vector
            .get_all(Some(&VectorFilter::tier(Tier::Session)), None)
            .unwrap();
        assert_eq!(in_session.len(), 1);

        let second = store.migrate_at(now, &cancel);
        assert_eq!(second.total_migrated(), 0);
    }

    #[test]
    fn important_memory_stays_despite_age() {
        let (store, _) = setup();
        let t0 = now() - Duration::days(3);
        let memory = store
            .store_at(
                "We decided the convention is snake_case, this is important",
                MemoryContext::Decision,
                &no_meta(),
                t0,
            )
            .unwrap();
        assert!(memory.importance >= 0.7 && memory.importance < 0.85);

        let report = store.migrate_at(t0 + Duration::hours(2), &CancellationToken::new());
        assert_eq!(report.total_migrated(), 0);
        assert_eq!(store.get(&memory.id).unwrap().unwrap().tier, Tier::Working);
    }

    #[test]
    fn migration_cascades_within_one_cycle() {
        let (store, _) = setup();
        let t0 = now() - Duration::days(5);
        let memory = store_note(&store, "plain note about team lunch plans", t0);

        let report = store.migrate_at(t0 + Duration::days(2), &CancellationToken::new());
        assert_eq!(report.total_migrated(), 2);
        assert_eq!(store.get(&memory.id).unwrap().unwrap().tier, Tier::LongTerm);
    }

    #[test]
    fn cap_evicts_least_recently_accessed() {
        let mut config = TieredStoreConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        };
        config.tiers.working.max_size = 2;
        let (store, _) = setup_with(config);

        let t0 = now();
        let ids: Vec<String> = (0..4)
            .map(|i| store_note(&store, &format!("fresh note number {i} about lunch"), t0).id)
            .collect();
        // Accessed later means evicted later
        for (i, id) in ids.iter().enumerate() {
            store.touch_at(id, t0 + Duration::seconds(i as i64 + 1));
        }

        let report = store.migrate_at(t0 + Duration::minutes(1), &CancellationToken::new());
        let step = report.step(Tier::Working).unwrap();
        assert_eq!(step.over_cap, 2);
        assert_eq!(step.migrated, 2);
        assert_eq!(store.get(&ids[0]).unwrap().unwrap().tier, Tier::Session);
        assert_eq!(store.get(&ids[1]).unwrap().unwrap().tier, Tier::Session);
        assert_eq!(store.get(&ids[3]).unwrap().unwrap().tier, Tier::Working);
    }

    #[test]
    fn cancelled_migration_returns_partial_report() {
        let (store, _) = setup();
        let t0 = now() - Duration::days(1);
        store_note(&store, "plain note about team lunch plans", t0);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = store.migrate_at(t0 + Duration::hours(2), &cancel);
        assert!(report.cancelled);
        assert_eq!(report.total_migrated(), 0);
        assert_eq!(report.steps.len(), 1);
    }

    #[test]
    fn delete_removes_from_both_backends() {
        let (store, vector) = setup();
        let memory = store_note(&store, "short lived scratch note", now());
        assert!(store.delete(&memory.id).unwrap());
        assert!(store.get(&memory.id).unwrap().is_none());
        assert_eq!(vector.count().unwrap(), 0);
        assert!(!store.delete(&memory.id).unwrap());
    }

    #[test]
    fn consolidate_merges_into_survivor() {
        let (store, vector) = setup();
        let t0 = now();
        let low = store_note(&store, "the build uses cargo workspaces", t0);
        let high = store
            .store_at(
                "important: the build uses cargo workspaces",
                MemoryContext::Decision,
                &no_meta(),
                t0,
            )
            .unwrap();
        store.touch_at(&low.id, t0 + Duration::minutes(1));
        store.touch_at(&low.id, t0 + Duration::minutes(2));
        store.touch_at(&high.id, t0 + Duration::minutes(1));

        let outcome = store
            .consolidate(&[low.id.clone(), high.id.clone(), "gone".into()])
            .unwrap();
        assert_eq!(outcome.survivor.id, high.id);
        assert_eq!(outcome.survivor.access_count, 3);
        assert_eq!(outcome.survivor.last_accessed_at, t0 + Duration::minutes(2));
        assert_eq!(outcome.removed, vec![low.id.clone()]);
        assert_eq!(outcome.missing, vec!["gone".to_string()]);
        assert!(store.get(&low.id).unwrap().is_none());
        assert_eq!(vector.count().unwrap(), 1);
    }

    #[test]
    fn consolidate_needs_two_ids() {
        let (store, _) = setup();
        let err = store.consolidate(&["a".into(), "a".into()]).unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[test]
    fn bulk_index_isolates_invalid_items() {
        let (store, vector) = setup();
        let t0 = now();
        let mut memories: Vec<Memory> = (0..5)
            .map(|i| Memory {
                id: format!("bulk-{i}"),
                content: format!("bulk imported note {i}"),
                context: MemoryContext::Documentation,
                importance: 0.5,
                tier: Tier::Working,
                created_at: t0,
                last_accessed_at: t0,
                access_count: 0,
                metadata: Default::default(),
            })
            .collect();
        memories[2].content = String::new();

        let report = store.bulk_index(memories, &CancellationToken::new());
        assert_eq!(report.indexed, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors[0].id, "bulk-2");
        assert_eq!(store.stats().unwrap().total, 4);
        assert_eq!(vector.count().unwrap(), 4);
    }
}
