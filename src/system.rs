//! Component wiring from configuration.
//!
//! Every component receives its backends as injected handles, so tests can
//! assemble the same graph over in-memory or fault-injecting stores through
//! [`TierMem::from_backends`].

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::backend::sqlite::SqliteRelationalStore;
use crate::backend::vector::SqliteVectorStore;
use crate::backend::Backends;
use crate::config::{expand_tilde, TierMemConfig};
use crate::embedding::{self, EmbeddingProvider};
use crate::health::HealthMonitor;
use crate::memory::compression::CompressionEngine;
use crate::memory::retrieval::RetrievalCoordinator;
use crate::memory::scoring::ScoringEngine;
use crate::memory::symbols::SymbolIndex;
use crate::memory::tiered::{TieredStore, TieredStoreConfig};
use crate::scheduler::Scheduler;

pub struct TierMem {
    pub config: Arc<TierMemConfig>,
    pub store: Arc<TieredStore>,
    pub retrieval: Arc<RetrievalCoordinator>,
    pub health: Arc<HealthMonitor>,
    pub symbols: SymbolIndex,
    /// Width of the vectors the embedder produces.
    pub dimensions: usize,
}

impl TierMem {
    /// Open both databases and the embedding provider named by `config`.
    pub fn open(config: TierMemConfig) -> Result<Self> {
        let provider = embedding::create_provider(&config.embedding)
            .context("failed to create embedding provider")?;
        let embedder: Arc<dyn EmbeddingProvider> = Arc::from(provider);
        tracing::info!(provider = %config.embedding.provider, "embedding provider ready");

        let db_path = config.resolved_db_path();
        let relational = SqliteRelationalStore::open(&db_path)?;
        tracing::info!(db = %db_path.display(), "relational backend ready");

        let vector_path = config.resolved_vector_db_path();
        let vector =
            SqliteVectorStore::open(&vector_path, embedder.dimensions(), &config.embedding.model)?;
        tracing::info!(db = %vector_path.display(), "vector backend ready");

        let compression = CompressionEngine::from_model_cache(
            &expand_tilde(&config.embedding.cache_dir),
            config.compression.clone(),
        );
        let backends = Backends::new(Arc::new(relational), Arc::new(vector), embedder);
        Ok(Self::from_backends(backends, compression, config))
    }

    /// Both backends in memory with the offline hashed embedder.
    pub fn in_memory(config: TierMemConfig) -> Result<Self> {
        let embedder = embedding::hashed::HashedEmbeddingProvider::new(config.embedding.dimensions);
        let backends = Backends::new(
            Arc::new(SqliteRelationalStore::open_in_memory()?),
            Arc::new(SqliteVectorStore::open_in_memory(config.embedding.dimensions)?),
            Arc::new(embedder),
        );
        let compression = CompressionEngine::with_estimator(config.compression.clone());
        Ok(Self::from_backends(backends, compression, config))
    }

    pub fn from_backends(
        backends: Backends,
        compression: CompressionEngine,
        config: TierMemConfig,
    ) -> Self {
        let dimensions = backends.embedder.dimensions();
        let store_config = TieredStoreConfig::from_config(&config);
        let retry = store_config.retry;
        let store = Arc::new(TieredStore::new(backends.clone(), store_config));
        let retrieval = Arc::new(RetrievalCoordinator::new(
            Arc::clone(&store),
            backends.clone(),
            ScoringEngine::new(config.scoring.clone()),
            compression,
            config.retrieval.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&store),
            Arc::clone(&retrieval),
            config.health.clone(),
        ));
        let symbols = SymbolIndex::new(
            Arc::clone(&backends.relational),
            retry,
            config.storage.bulk_batch_size,
        );

        Self {
            config: Arc::new(config),
            store,
            retrieval,
            health,
            symbols,
            dimensions,
        }
    }

    /// Start the periodic jobs per `scheduler` configuration.
    pub fn start_scheduler(&self) -> Scheduler {
        Scheduler::start(
            Arc::clone(&self.store),
            Arc::clone(&self.health),
            &self.config.scheduler,
        )
    }
}
