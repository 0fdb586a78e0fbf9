//! SQL DDL for both physical backends.
//!
//! The relational database holds `memories`, `memories_fts` (FTS5),
//! `memory_metadata`, `symbols`, `memory_log`, and `schema_meta`. The vector
//! database holds `vector_documents`, `memories_vec` (vec0), and its own
//! `schema_meta`. All DDL uses `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

/// Relational backend DDL.
const SCHEMA_SQL: &str = r#"
-- Canonical memory records
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL CHECK(length(content) > 0),
    context TEXT NOT NULL CHECK(context IN ('code_snippet','preference','decision','critical_task','conversation','documentation','general')),
    importance REAL NOT NULL CHECK(importance >= 0.0 AND importance <= 1.0),
    tier TEXT NOT NULL CHECK(tier IN ('working','session','long_term')),
    created_at TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_tier ON memories(tier);
CREATE INDEX IF NOT EXISTS idx_memories_context ON memories(context);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);

-- Keyword index (BM25)
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    content='memories',
    content_rowid='rowid'
);

-- Exact metadata lookups
CREATE TABLE IF NOT EXISTS memory_metadata (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (memory_id, key)
);

CREATE INDEX IF NOT EXISTS idx_metadata_key_value ON memory_metadata(key, value);

-- Code symbol index
CREATE TABLE IF NOT EXISTS symbols (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    file_path TEXT NOT NULL,
    line INTEGER NOT NULL,
    signature TEXT,
    indexed_at TEXT NOT NULL,
    UNIQUE(file_path, line, name)
);

CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(name);
CREATE INDEX IF NOT EXISTS idx_symbols_kind ON symbols(kind);

-- Audit log
CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN ('create','update','migrate','consolidate','delete')),
    memory_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Vector backend DDL, minus the vec0 table whose width is configurable.
const VECTOR_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS vector_documents (
    id TEXT PRIMARY KEY,
    document TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual table must be created separately (sqlite-vec syntax).
fn vec_table_sql(dimensions: usize) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memories_vec USING vec0(\n    \
         id TEXT PRIMARY KEY,\n    \
         embedding FLOAT[{dimensions}]\n);"
    )
}

/// Initialize the relational schema. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}

/// Initialize the vector schema for embeddings of `dimensions` floats.
pub fn init_vector_schema(conn: &Connection, dimensions: usize) -> rusqlite::Result<()> {
    conn.execute_batch(VECTOR_SCHEMA_SQL)?;
    conn.execute_batch(&vec_table_sql(dimensions))?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('dimensions', ?1)",
        [dimensions.to_string()],
    )?;
    Ok(())
}
