//! Hierarchical memory for coding assistants.
//!
//! TierMem keeps short-lived conversational context separate from durable
//! knowledge. Memories live in three retention tiers and move forward as they
//! age unless they are important enough to stay:
//!
//! | Tier | Default retention | Default cap | Stays when importance ≥ |
//! |------|-------------------|-------------|-------------------------|
//! | **working** | 1 hour | 200 | 0.7 |
//! | **session** | 24 hours | 2 000 | 0.8 |
//! | **long_term** | 365 days | 100 000 | (terminal) |
//!
//! # Architecture
//!
//! - **Storage**: two physical backends behind [`backend::RelationalStore`]
//!   (SQLite with FTS5, the canonical record) and [`backend::VectorStore`]
//!   ([sqlite-vec](https://github.com/asg017/sqlite-vec), similarity search)
//! - **Embeddings**: local ONNX Runtime with all-MiniLM-L6-v2, or a
//!   deterministic hashed embedder that needs no model files
//! - **Recall**: exact, semantic and hybrid search ranked by a weighted blend
//!   of relevance, recency, importance and access frequency
//! - **Compression**: token-budgeted context assembly with signal-line
//!   filtering and structural summaries
//! - **Diagnostics**: fragmentation, duplicate, orphan and latency checks
//!   with recommendations
//!
//! # Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`error`]: Typed error taxonomy
//! - [`db`]: SQLite initialization, schema, migrations and integrity checks
//! - [`backend`]: Backend contracts, SQLite implementations and retry policy
//! - [`embedding`]: Text-to-vector providers
//! - [`memory`]: Tiered store, scoring, retrieval, compression and symbol index
//! - [`health`]: Health Monitor stages and reports
//! - [`scheduler`]: Periodic migration and health jobs
//! - [`system`]: Component wiring from configuration

pub mod backend;
pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod health;
pub mod memory;
pub mod scheduler;
pub mod system;
