use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::memory::types::{MemoryContext, Tier};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TierMemConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub tiers: TiersConfig,
    pub importance: ImportanceConfig,
    pub scoring: ScoringConfig,
    pub retrieval: RetrievalConfig,
    pub compression: CompressionConfig,
    pub health: HealthConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Relational backend (memories, FTS, symbols, audit log).
    pub db_path: String,
    /// Vector backend (sqlite-vec); a separate database file.
    pub vector_db_path: String,
    /// Rows per transaction for bulk indexing.
    pub bulk_batch_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `local` (ONNX all-MiniLM-L6-v2) or `hashed` (deterministic, offline).
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
    pub dimensions: usize,
}

/// Retention policy for a single tier.
#[derive(Debug, Clone, PartialEq)]
pub struct TierConfig {
    pub name: String,
    /// Age after which a memory becomes eligible to move to the next tier.
    pub retention_secs: u64,
    /// Soft cap on the tier population.
    pub max_size: usize,
    /// Memories at or above this importance stay despite their age.
    pub importance_threshold: f64,
    /// Memories accessed fewer times than this migrate once aged. 0 disables the floor.
    pub min_access_count: u32,
    /// Summarize this tier's memories when assembling compressed context.
    pub compression_enabled: bool,
}

impl TierConfig {
    pub fn working() -> Self {
        Self {
            name: "working".into(),
            retention_secs: 60 * 60,
            max_size: 200,
            importance_threshold: 0.7,
            min_access_count: 0,
            compression_enabled: false,
        }
    }

    pub fn session() -> Self {
        Self {
            name: "session".into(),
            retention_secs: 24 * 60 * 60,
            max_size: 2_000,
            importance_threshold: 0.8,
            min_access_count: 0,
            compression_enabled: false,
        }
    }

    pub fn long_term() -> Self {
        Self {
            name: "long_term".into(),
            retention_secs: 365 * 24 * 60 * 60,
            max_size: 100_000,
            importance_threshold: 0.0,
            min_access_count: 0,
            compression_enabled: true,
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Clone)]
pub struct TiersConfig {
    pub working: TierConfig,
    pub session: TierConfig,
    pub long_term: TierConfig,
    /// New memories at or above this importance skip straight to long-term.
    pub promote_on_store_importance: f64,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            working: TierConfig::working(),
            session: TierConfig::session(),
            long_term: TierConfig::long_term(),
            promote_on_store_importance: 0.85,
        }
    }
}

/// Partial tier table from TOML, merged over the tier's own defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TierOverride {
    retention_secs: Option<u64>,
    max_size: Option<usize>,
    importance_threshold: Option<f64>,
    min_access_count: Option<u32>,
    compression_enabled: Option<bool>,
}

impl TierOverride {
    fn apply(self, mut base: TierConfig) -> TierConfig {
        if let Some(v) = self.retention_secs {
            base.retention_secs = v;
        }
        if let Some(v) = self.max_size {
            base.max_size = v;
        }
        if let Some(v) = self.importance_threshold {
            base.importance_threshold = v;
        }
        if let Some(v) = self.min_access_count {
            base.min_access_count = v;
        }
        if let Some(v) = self.compression_enabled {
            base.compression_enabled = v;
        }
        base
    }
}

impl<'de> Deserialize<'de> for TiersConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct RawTiers {
            working: TierOverride,
            session: TierOverride,
            long_term: TierOverride,
            promote_on_store_importance: Option<f64>,
        }

        let raw = RawTiers::deserialize(deserializer)?;
        let defaults = TiersConfig::default();
        Ok(Self {
            working: raw.working.apply(defaults.working),
            session: raw.session.apply(defaults.session),
            long_term: raw.long_term.apply(defaults.long_term),
            promote_on_store_importance: raw
                .promote_on_store_importance
                .unwrap_or(defaults.promote_on_store_importance),
        })
    }
}

impl TiersConfig {
    pub fn get(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Working => &self.working,
            Tier::Session => &self.session,
            Tier::LongTerm => &self.long_term,
        }
    }
}

/// A group of keywords that shifts importance when any of them appears.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ImportanceSignal {
    pub keywords: Vec<String>,
    pub boost: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ImportanceConfig {
    pub base: f64,
    pub signals: Vec<ImportanceSignal>,
    /// Content shorter than this (chars) is penalized.
    pub short_content_chars: usize,
    /// Content longer than this (chars) is penalized.
    pub long_content_chars: usize,
    pub length_penalty: f64,
    /// Unique-word ratio below which content counts as redundant.
    pub redundancy_ratio: f64,
    pub redundancy_penalty: f64,
}

impl Default for ImportanceConfig {
    fn default() -> Self {
        let signal = |keywords: &[&str], boost: f64| ImportanceSignal {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            boost,
        };
        Self {
            base: 0.4,
            signals: vec![
                signal(
                    &["password", "secret", "api key", "api_key", "credential", "token"],
                    0.25,
                ),
                signal(&["important", "critical", "must", "never", "always"], 0.15),
                signal(&["todo", "fixme", "bug", "hack"], 0.1),
                signal(&["decided", "decision", "prefer", "convention"], 0.1),
            ],
            short_content_chars: 20,
            long_content_chars: 5_000,
            length_penalty: 0.1,
            redundancy_ratio: 0.3,
            redundancy_penalty: 0.15,
        }
    }
}

impl ImportanceConfig {
    /// Context bonus applied on top of keyword signals.
    pub fn context_bonus(&self, context: MemoryContext) -> f64 {
        match context {
            MemoryContext::CriticalTask => 0.3,
            MemoryContext::Decision => 0.15,
            MemoryContext::Preference => 0.1,
            MemoryContext::CodeSnippet => 0.05,
            MemoryContext::Documentation => 0.05,
            MemoryContext::Conversation | MemoryContext::General => 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct ScoringWeights {
    pub semantic: f64,
    pub recency: f64,
    pub importance: f64,
    pub frequency: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            semantic: 0.4,
            recency: 0.3,
            importance: 0.2,
            frequency: 0.1,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    /// Hours for the recency score to halve.
    pub recency_half_life_hours: f64,
    /// Access count at which the frequency score saturates at 1.0.
    pub frequency_saturation: u32,
    /// Scores closer than this are treated as ties.
    pub tie_epsilon: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            recency_half_life_hours: 72.0,
            frequency_saturation: 100,
            tie_epsilon: 1e-6,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    /// Weight of the exact-match indicator in hybrid search.
    pub hybrid_exact_weight: f64,
    /// Each hybrid mode fetches `limit * candidate_multiplier` candidates before ranking.
    pub candidate_multiplier: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            hybrid_exact_weight: 0.4,
            candidate_multiplier: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CompressionConfig {
    pub default_max_tokens: usize,
    /// Lines kept on each side of an important line during smart filtering.
    pub context_window: usize,
    pub summary_fallback_lines: usize,
    pub per_memory_summary_tokens: usize,
    pub truncation_marker: String,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: 4_000,
            context_window: 2,
            summary_fallback_lines: 10,
            per_memory_summary_tokens: 200,
            truncation_marker: "\n... [truncated]".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthConfig {
    pub fragmentation_gap_secs: u64,
    pub fragmentation_warning_pct: f64,
    pub fragmentation_error_pct: f64,
    pub duplicate_threshold: f64,
    /// Upper bound on memories compared pairwise.
    pub duplicate_sample_size: usize,
    /// Upper bound on memories scanned by the fragmentation and orphan stages.
    pub scan_limit: usize,
    pub orphan_stale_days: i64,
    pub orphan_stale_importance: f64,
    pub orphan_never_accessed_days: i64,
    pub orphan_low_importance: f64,
    pub orphan_min_access_count: u32,
    pub slow_query_ms: u64,
    pub performance_window: usize,
    pub probe_queries: Vec<String>,
    pub stage_budget_ms: u64,
    pub recommend_duplicates_over: usize,
    pub recommend_orphans_over: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            fragmentation_gap_secs: 60 * 60,
            fragmentation_warning_pct: 15.0,
            fragmentation_error_pct: 30.0,
            duplicate_threshold: 0.85,
            duplicate_sample_size: 1_000,
            scan_limit: 50_000,
            orphan_stale_days: 30,
            orphan_stale_importance: 0.5,
            orphan_never_accessed_days: 7,
            orphan_low_importance: 0.3,
            orphan_min_access_count: 2,
            slow_query_ms: 100,
            performance_window: 100,
            probe_queries: vec![
                "function".into(),
                "error handling".into(),
                "TODO".into(),
                "configuration".into(),
                "authentication".into(),
            ],
            stage_budget_ms: 5_000,
            recommend_duplicates_over: 10,
            recommend_orphans_over: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub migration_interval_secs: u64,
    pub health_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            migration_interval_secs: 15 * 60,
            health_interval_secs: 6 * 60 * 60,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let dir = default_tiermem_dir();
        Self {
            db_path: dir.join("memory.db").to_string_lossy().into_owned(),
            vector_db_path: dir.join("vectors.db").to_string_lossy().into_owned(),
            bulk_batch_size: 500,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_tiermem_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
            dimensions: 384,
        }
    }
}

/// Returns `~/.tiermem/`
pub fn default_tiermem_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".tiermem")
}

/// Returns the default config file path: `~/.tiermem/config.toml`
pub fn default_config_path() -> PathBuf {
    default_tiermem_dir().join("config.toml")
}

impl TierMemConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, apply env var overrides, and validate.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            TierMemConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides (TIERMEM_DB, TIERMEM_VECTOR_DB, TIERMEM_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TIERMEM_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("TIERMEM_VECTOR_DB") {
            self.storage.vector_db_path = val;
        }
        if let Ok(val) = std::env::var("TIERMEM_LOG_LEVEL") {
            self.server.log_level = val;
        }
    }

    /// Reject configurations the memory core cannot honor.
    pub fn validate(&self) -> Result<()> {
        let t = &self.tiers;
        if !(t.working.retention_secs < t.session.retention_secs
            && t.session.retention_secs < t.long_term.retention_secs)
        {
            bail!(
                "tier retention windows must be strictly increasing: working={}s session={}s long_term={}s",
                t.working.retention_secs,
                t.session.retention_secs,
                t.long_term.retention_secs
            );
        }

        let w = &self.scoring.weights;
        for (name, value) in [
            ("semantic", w.semantic),
            ("recency", w.recency),
            ("importance", w.importance),
            ("frequency", w.frequency),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("scoring weight `{name}` must be within [0, 1], got {value}");
            }
        }

        if !(0.0..=1.0).contains(&self.retrieval.hybrid_exact_weight) {
            bail!(
                "retrieval.hybrid_exact_weight must be within [0, 1], got {}",
                self.retrieval.hybrid_exact_weight
            );
        }
        if self.retrieval.candidate_multiplier == 0 || self.storage.bulk_batch_size == 0 {
            bail!("retrieval.candidate_multiplier and storage.bulk_batch_size must be greater than zero");
        }
        if self.health.duplicate_sample_size == 0 || self.health.scan_limit == 0 {
            bail!("health sample sizes must be greater than zero");
        }
        if self.embedding.dimensions == 0 {
            bail!("embedding.dimensions must be greater than zero");
        }
        Ok(())
    }

    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    pub fn resolved_vector_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.vector_db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = TierMemConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.retrieval.hybrid_exact_weight, 0.4);
        assert_eq!(config.health.duplicate_threshold, 0.85);
        assert_eq!(config.health.fragmentation_gap_secs, 3600);
        assert!(config.storage.db_path.ends_with("memory.db"));
        assert!(config.storage.vector_db_path.ends_with("vectors.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
db_path = "/tmp/test.db"

[tiers.working]
retention_secs = 600
max_size = 50

[tiers.session]
max_size = 10

[scoring.weights]
semantic = 0.7

[health]
duplicate_threshold = 0.9
"#;
        let config: TierMemConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.tiers.working.retention_secs, 600);
        assert_eq!(config.tiers.working.max_size, 50);
        assert_eq!(config.scoring.weights.semantic, 0.7);
        assert_eq!(config.health.duplicate_threshold, 0.9);
        // defaults still apply for unset fields
        assert_eq!(config.scoring.weights.recency, 0.3);
        assert_eq!(config.tiers.session.max_size, 10);
        assert_eq!(config.tiers.session.retention_secs, 24 * 60 * 60);
        assert_eq!(config.tiers.session.name, "session");
        assert_eq!(config.health.slow_query_ms, 100);
    }

    #[test]
    fn non_increasing_retention_is_rejected() {
        let mut config = TierMemConfig::default();
        config.tiers.session.retention_secs = config.tiers.working.retention_secs;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("strictly increasing"));
    }

    #[test]
    fn out_of_range_weight_is_rejected() {
        let mut config = TierMemConfig::default();
        config.scoring.weights.frequency = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = TierMemConfig::default();
        std::env::set_var("TIERMEM_DB", "/tmp/override.db");
        std::env::set_var("TIERMEM_VECTOR_DB", "/tmp/override-vec.db");
        std::env::set_var("TIERMEM_LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.storage.vector_db_path, "/tmp/override-vec.db");
        assert_eq!(config.server.log_level, "trace");

        // Clean up
        std::env::remove_var("TIERMEM_DB");
        std::env::remove_var("TIERMEM_VECTOR_DB");
        std::env::remove_var("TIERMEM_LOG_LEVEL");
    }
}
