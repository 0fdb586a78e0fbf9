#![allow(dead_code)]

use chrono::{DateTime, SubsecRound, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use tiermem::backend::{
    Backends, ExactQuery, ListFilter, RelationalStore, SqliteRelationalStore, SqliteVectorStore,
    StoreStats, SymbolQuery, SymbolRow, VectorDocument, VectorFilter, VectorHit, VectorStore,
};
use tiermem::config::TierMemConfig;
use tiermem::embedding::hashed::HashedEmbeddingProvider;
use tiermem::error::{BackendError, BackendErrorKind, BackendKind, BackendResult};
use tiermem::memory::compression::CompressionEngine;
use tiermem::memory::types::{Memory, MemoryContext, Metadata, Tier};
use tiermem::system::TierMem;

pub const DIMS: usize = 64;

/// Defaults with the offline embedder and millisecond retry backoff.
pub fn test_config() -> TierMemConfig {
    let mut config = TierMemConfig::default();
    config.embedding.provider = "hashed".into();
    config.embedding.dimensions = DIMS;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 4;
    config
}

/// Full stack over in-memory SQLite for both backends.
pub fn test_system() -> TierMem {
    TierMem::in_memory(test_config()).unwrap()
}

pub fn test_system_with(config: TierMemConfig) -> TierMem {
    TierMem::in_memory(config).unwrap()
}

/// Current time at the precision the relational backend stores.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub fn no_meta() -> serde_json::Map<String, serde_json::Value> {
    serde_json::Map::new()
}

pub fn store(system: &TierMem, content: &str) -> Memory {
    system
        .store
        .store(content, MemoryContext::General, &no_meta())
        .unwrap()
}

/// A memory built directly, for seeding backdated state through bulk indexing.
pub fn memory_at(content: &str, tier: Tier, importance: f64, created_at: DateTime<Utc>) -> Memory {
    let created_at = created_at.trunc_subsecs(3);
    Memory {
        id: uuid::Uuid::now_v7().to_string(),
        content: content.to_string(),
        context: MemoryContext::General,
        importance,
        tier,
        created_at,
        last_accessed_at: created_at,
        access_count: 0,
        metadata: Metadata::new(),
    }
}

/// Bulk-index `memories` and insist every one landed in both backends.
pub fn seed(system: &TierMem, memories: Vec<Memory>) {
    let expected = memories.len();
    let report = system.store.bulk_index(memories, &CancellationToken::new());
    assert_eq!(report.failed, 0, "seeding failed: {:?}", report.errors);
    assert_eq!(report.indexed, expected);
}

// ── Fault injection ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Rule {
    Always(BackendErrorKind),
    Times(u32, BackendErrorKind),
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Per-operation failure switches shared between a test and a backend double.
#[derive(Default)]
pub struct Faults {
    rules: Mutex<HashMap<&'static str, Rule>>,
    calls: Mutex<HashMap<&'static str, u32>>,
    hooks: Mutex<HashMap<&'static str, Hook>>,
}

impl Faults {
    /// Fail every call to `op` permanently.
    pub fn fail(&self, op: &'static str) {
        self.rules
            .lock()
            .unwrap()
            .insert(op, Rule::Always(BackendErrorKind::Permanent));
    }

    /// Fail every call to `op` with a transient error.
    pub fn fail_transient(&self, op: &'static str) {
        self.rules
            .lock()
            .unwrap()
            .insert(op, Rule::Always(BackendErrorKind::Transient));
    }

    /// Fail the next `n` calls to `op` with a transient error, then recover.
    pub fn fail_times(&self, op: &'static str, n: u32) {
        self.rules
            .lock()
            .unwrap()
            .insert(op, Rule::Times(n, BackendErrorKind::Transient));
    }

    /// Run `hook` at the start of every call to `op`, before it reaches the
    /// real backend. Simulates a concurrent writer landing mid-operation.
    pub fn on_call(&self, op: &'static str, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.lock().unwrap().insert(op, Arc::new(hook));
    }

    pub fn clear(&self) {
        self.rules.lock().unwrap().clear();
        self.hooks.lock().unwrap().clear();
    }

    /// Calls to `op` seen so far, failed or not.
    pub fn calls(&self, op: &'static str) -> u32 {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    fn check(&self, backend: BackendKind, op: &'static str) -> BackendResult<()> {
        *self.calls.lock().unwrap().entry(op).or_insert(0) += 1;
        let hook = self.hooks.lock().unwrap().get(op).cloned();
        if let Some(hook) = hook {
            hook();
        }
        let mut rules = self.rules.lock().unwrap();
        let kind = match rules.get_mut(op) {
            None => return Ok(()),
            Some(Rule::Always(kind)) => *kind,
            Some(Rule::Times(0, _)) => return Ok(()),
            Some(Rule::Times(n, kind)) => {
                *n -= 1;
                *kind
            }
        };
        Err(BackendError::new(backend, kind, format!("injected {op} failure")))
    }
}

pub struct FaultyRelational {
    pub inner: Arc<SqliteRelationalStore>,
    pub faults: Arc<Faults>,
}

impl FaultyRelational {
    fn check(&self, op: &'static str) -> BackendResult<()> {
        self.faults.check(BackendKind::Relational, op)
    }
}

impl RelationalStore for FaultyRelational {
    fn upsert_memory(&self, memory: &Memory) -> BackendResult<()> {
        self.check("upsert_memory")?;
        self.inner.upsert_memory(memory)
    }

    fn upsert_many(&self, memories: &[Memory]) -> BackendResult<usize> {
        self.check("upsert_many")?;
        self.inner.upsert_many(memories)
    }

    fn exact_search(&self, query: &ExactQuery) -> BackendResult<Vec<Memory>> {
        self.check("exact_search")?;
        self.inner.exact_search(query)
    }

    fn get(&self, id: &str) -> BackendResult<Option<Memory>> {
        self.check("get")?;
        self.inner.get(id)
    }

    fn get_many(&self, ids: &[String]) -> BackendResult<Vec<Memory>> {
        self.check("get_many")?;
        self.inner.get_many(ids)
    }

    fn list(&self, filter: &ListFilter) -> BackendResult<Vec<Memory>> {
        self.check("list")?;
        self.inner.list(filter)
    }

    fn count_by_tier(&self) -> BackendResult<BTreeMap<Tier, u64>> {
        self.check("count_by_tier")?;
        self.inner.count_by_tier()
    }

    fn set_tier(&self, id: &str, from: Tier, to: Tier) -> BackendResult<bool> {
        self.check("set_tier")?;
        self.inner.set_tier(id, from, to)
    }

    fn record_access(&self, id: &str, at: DateTime<Utc>) -> BackendResult<()> {
        self.check("record_access")?;
        self.inner.record_access(id, at)
    }

    fn merge_stats(
        &self,
        id: &str,
        importance: f64,
        accesses: u32,
        last_accessed_at: DateTime<Utc>,
    ) -> BackendResult<bool> {
        self.check("merge_stats")?;
        self.inner.merge_stats(id, importance, accesses, last_accessed_at)
    }

    fn delete(&self, id: &str) -> BackendResult<bool> {
        self.check("delete")?;
        self.inner.delete(id)
    }

    fn upsert_symbols(&self, symbols: &[SymbolRow]) -> BackendResult<usize> {
        self.check("upsert_symbols")?;
        self.inner.upsert_symbols(symbols)
    }

    fn find_symbols(&self, query: &SymbolQuery) -> BackendResult<Vec<SymbolRow>> {
        self.check("find_symbols")?;
        self.inner.find_symbols(query)
    }

    fn stats(&self) -> BackendResult<StoreStats> {
        self.check("stats")?;
        self.inner.stats()
    }
}

pub struct FaultyVector {
    pub inner: Arc<SqliteVectorStore>,
    pub faults: Arc<Faults>,
}

impl FaultyVector {
    fn check(&self, op: &'static str) -> BackendResult<()> {
        self.faults.check(BackendKind::Vector, op)
    }
}

impl VectorStore for FaultyVector {
    fn upsert(&self, id: &str, vector: &[f32], document: &str, metadata: &Metadata) -> BackendResult<()> {
        self.check("upsert")?;
        self.inner.upsert(id, vector, document, metadata)
    }

    fn query(&self, vector: &[f32], filter: Option<&VectorFilter>, k: usize) -> BackendResult<Vec<VectorHit>> {
        self.check("query")?;
        self.inner.query(vector, filter, k)
    }

    fn get_all(&self, filter: Option<&VectorFilter>, limit: Option<usize>) -> BackendResult<Vec<VectorDocument>> {
        self.check("get_all")?;
        self.inner.get_all(filter, limit)
    }

    fn update_metadata(&self, id: &str, metadata: &Metadata) -> BackendResult<bool> {
        self.check("update_metadata")?;
        self.inner.update_metadata(id, metadata)
    }

    fn delete(&self, id: &str) -> BackendResult<bool> {
        self.check("delete")?;
        self.inner.delete(id)
    }

    fn count(&self) -> BackendResult<u64> {
        self.check("count")?;
        self.inner.count()
    }
}

/// A full stack whose backends fail on demand.
pub struct FaultyStack {
    pub system: TierMem,
    pub relational: Arc<SqliteRelationalStore>,
    pub vector: Arc<SqliteVectorStore>,
    pub relational_faults: Arc<Faults>,
    pub vector_faults: Arc<Faults>,
}

pub fn faulty_system() -> FaultyStack {
    faulty_system_with(test_config())
}

pub fn faulty_system_with(config: TierMemConfig) -> FaultyStack {
    let relational = Arc::new(SqliteRelationalStore::open_in_memory().unwrap());
    let vector = Arc::new(SqliteVectorStore::open_in_memory(DIMS).unwrap());
    let relational_faults = Arc::new(Faults::default());
    let vector_faults = Arc::new(Faults::default());

    let backends = Backends::new(
        Arc::new(FaultyRelational {
            inner: Arc::clone(&relational),
            faults: Arc::clone(&relational_faults),
        }),
        Arc::new(FaultyVector {
            inner: Arc::clone(&vector),
            faults: Arc::clone(&vector_faults),
        }),
        Arc::new(HashedEmbeddingProvider::new(DIMS)),
    );
    let compression = CompressionEngine::with_estimator(config.compression.clone());

    FaultyStack {
        system: TierMem::from_backends(backends, compression, config),
        relational,
        vector,
        relational_faults,
        vector_faults,
    }
}
