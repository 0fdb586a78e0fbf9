//! Storage backend contracts.
//!
//! The Tiered Store and Retrieval Coordinator talk to storage only through
//! [`RelationalStore`] and [`VectorStore`], handed to them as `Arc<dyn ..>`.
//! SQLite implementations live in [`sqlite`] and [`vector`]; [`retry`] wraps
//! calls in bounded exponential backoff.

pub mod retry;
pub mod sqlite;
pub mod vector;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::embedding::EmbeddingProvider;
use crate::error::BackendResult;
use crate::memory::types::{Memory, Metadata, MetadataValue, Tier};

pub use retry::RetryPolicy;
pub use sqlite::SqliteRelationalStore;
pub use vector::SqliteVectorStore;

// ── Relational contract ───────────────────────────────────────────────────────

/// Which part of a memory an exact search looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExactField {
    /// Keyword match over the content (FTS5).
    Content,
    /// Equality on the context tag.
    Context,
    /// Equality on one metadata key.
    Metadata(String),
}

#[derive(Debug, Clone)]
pub struct ExactQuery {
    pub text: String,
    pub field: ExactField,
    pub limit: usize,
}

impl ExactQuery {
    pub fn content(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            field: ExactField::Content,
            limit,
        }
    }
}

/// Row order for [`RelationalStore::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrder {
    #[default]
    CreatedAsc,
    CreatedDesc,
    /// Eviction order: least recently accessed, then lowest importance, then id.
    LeastRecentlyAccessed,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub tier: Option<Tier>,
    /// Only memories created strictly before this instant.
    pub created_before: Option<DateTime<Utc>>,
    pub order: ListOrder,
    pub limit: Option<usize>,
}

impl ListFilter {
    pub fn tier(tier: Tier) -> Self {
        Self {
            tier: Some(tier),
            ..Default::default()
        }
    }
}

/// A code symbol row in the bulk symbol index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolRow {
    pub name: String,
    pub kind: String,
    pub file_path: String,
    pub line: u32,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolQuery {
    pub name: String,
    /// Match names starting with `name` instead of equal to it.
    pub prefix: bool,
    pub kind: Option<String>,
    pub limit: usize,
}

/// Aggregate counts over the relational store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub total: u64,
    pub by_tier: BTreeMap<String, u64>,
    pub by_context: BTreeMap<String, u64>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub symbol_count: u64,
}

/// Canonical record store. Owns tier placement and access statistics.
pub trait RelationalStore: Send + Sync {
    /// Insert or replace one memory, keeping the keyword and metadata indexes in sync.
    fn upsert_memory(&self, memory: &Memory) -> BackendResult<()>;

    /// Insert or replace many memories in one transaction. Returns rows written.
    fn upsert_many(&self, memories: &[Memory]) -> BackendResult<usize>;

    /// Index lookup, best match first.
    fn exact_search(&self, query: &ExactQuery) -> BackendResult<Vec<Memory>>;

    fn get(&self, id: &str) -> BackendResult<Option<Memory>>;

    /// Fetch by id; missing ids are skipped. Order follows `ids`.
    fn get_many(&self, ids: &[String]) -> BackendResult<Vec<Memory>>;

    fn list(&self, filter: &ListFilter) -> BackendResult<Vec<Memory>>;

    fn count_by_tier(&self) -> BackendResult<BTreeMap<Tier, u64>>;

    /// Move a memory `from -> to` only if it is still in `from`. Returns whether it moved.
    fn set_tier(&self, id: &str, from: Tier, to: Tier) -> BackendResult<bool>;

    /// Increment the access count and stamp `last_accessed_at`.
    fn record_access(&self, id: &str, at: DateTime<Utc>) -> BackendResult<()>;

    /// Fold merged statistics into a row in place: raise importance to at
    /// least `importance`, add `accesses`, keep the later access time.
    /// Tier and content are left alone. Returns whether the row exists.
    fn merge_stats(
        &self,
        id: &str,
        importance: f64,
        accesses: u32,
        last_accessed_at: DateTime<Utc>,
    ) -> BackendResult<bool>;

    /// Returns whether a row was removed.
    fn delete(&self, id: &str) -> BackendResult<bool>;

    fn upsert_symbols(&self, symbols: &[SymbolRow]) -> BackendResult<usize>;

    fn find_symbols(&self, query: &SymbolQuery) -> BackendResult<Vec<SymbolRow>>;

    fn stats(&self) -> BackendResult<StoreStats>;
}

// ── Vector contract ───────────────────────────────────────────────────────────

/// Metadata equality predicates, all of which must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorFilter {
    pub equals: Vec<(String, MetadataValue)>,
}

impl VectorFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.equals.push((key.into(), value.into()));
        self
    }

    pub fn tier(tier: Tier) -> Self {
        Self::new().with(META_TIER, tier.as_str())
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.equals
            .iter()
            .all(|(key, value)| metadata.get(key).unwrap_or(&MetadataValue::Null) == value)
    }
}

/// Placement metadata the vector backend carries next to user metadata.
pub const META_TIER: &str = "memory_tier";
pub const META_CONTEXT: &str = "memory_context";

/// One nearest-neighbor result.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: String,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub similarity: f64,
}

/// A stored document as returned by full scans.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorDocument {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
}

/// Similarity index over memory embeddings.
pub trait VectorStore: Send + Sync {
    fn upsert(
        &self,
        id: &str,
        vector: &[f32],
        document: &str,
        metadata: &Metadata,
    ) -> BackendResult<()>;

    /// `k` nearest neighbors, most similar first.
    fn query(
        &self,
        vector: &[f32],
        filter: Option<&VectorFilter>,
        k: usize,
    ) -> BackendResult<Vec<VectorHit>>;

    fn get_all(
        &self,
        filter: Option<&VectorFilter>,
        limit: Option<usize>,
    ) -> BackendResult<Vec<VectorDocument>>;

    /// Replace a document's metadata. Returns whether the document exists.
    fn update_metadata(&self, id: &str, metadata: &Metadata) -> BackendResult<bool>;

    fn delete(&self, id: &str) -> BackendResult<bool>;

    fn count(&self) -> BackendResult<u64>;
}

/// Handles injected into the Tiered Store and Retrieval Coordinator.
#[derive(Clone)]
pub struct Backends {
    pub relational: Arc<dyn RelationalStore>,
    pub vector: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
}

impl Backends {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        vector: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            relational,
            vector,
            embedder,
        }
    }
}

/// Vector-side metadata for a memory: user metadata plus placement keys.
pub fn vector_metadata(memory: &Memory) -> Metadata {
    let mut metadata = memory.metadata.clone();
    metadata.insert(META_TIER.into(), memory.tier.as_str().into());
    metadata.insert(META_CONTEXT.into(), memory.context.as_str().into());
    metadata
}

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            std::mem::size_of_val(embedding),
        )
    }
}
