pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

fn open_file(path: &Path) -> Result<Connection> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    // Enable WAL mode so reads proceed during migration and bulk indexing
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

/// Open (or create) the relational database with schema and migrations applied.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    let mut conn = open_file(path)?;

    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&mut conn).context("failed to run migrations")?;

    tracing::info!(path = %path.display(), "relational database initialized");
    Ok(conn)
}

/// Open (or create) the vector database for `dimensions`-wide embeddings.
///
/// Warns when the vectors on disk were produced by a different model.
pub fn open_vector_database(
    path: impl AsRef<Path>,
    dimensions: usize,
    model: &str,
) -> Result<Connection> {
    let path = path.as_ref();
    load_sqlite_vec();
    let conn = open_file(path)?;

    schema::init_vector_schema(&conn, dimensions).context("failed to initialize vector schema")?;
    check_vector_model(&conn, dimensions, model)?;

    tracing::info!(path = %path.display(), dimensions, "vector database initialized");
    Ok(conn)
}

/// Open an in-memory relational database.
pub fn open_memory_database() -> Result<Connection> {
    let mut conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&mut conn).context("failed to run migrations")?;
    Ok(conn)
}

/// Open an in-memory vector database.
pub fn open_memory_vector_database(dimensions: usize) -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    schema::init_vector_schema(&conn, dimensions).context("failed to initialize vector schema")?;
    Ok(conn)
}

fn check_vector_model(conn: &Connection, dimensions: usize, model: &str) -> Result<()> {
    let stored_dims: Option<usize> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'dimensions'",
            [],
            |row| row.get::<_, String>(0),
        )
        .ok()
        .and_then(|v| v.parse().ok());
    if let Some(stored) = stored_dims {
        if stored != dimensions {
            anyhow::bail!(
                "vector database was created for {stored}-dimensional embeddings, \
                 but {dimensions} are configured"
            );
        }
    }

    let stored_model = migrations::ensure_embedding_model(conn, model)?;
    if stored_model != model {
        tracing::warn!(
            stored = %stored_model,
            configured = %model,
            "embedding model changed; semantic scores mix vectors from both models"
        );
    }
    Ok(())
}

// ── Health checks ─────────────────────────────────────────────────────────────

/// Integrity and row counts of the relational database.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealth {
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub schema_version: u32,
    pub memory_count: u64,
    pub symbol_count: u64,
    pub log_count: u64,
}

/// Integrity and row counts of the vector database.
#[derive(Debug, Clone, Serialize)]
pub struct VectorDatabaseHealth {
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub sqlite_vec_version: String,
    pub embedding_model: Option<String>,
    pub vector_count: u64,
    pub document_count: u64,
}

fn integrity_check(conn: &Connection) -> Result<(bool, String)> {
    let results: Vec<String> = conn
        .prepare("PRAGMA integrity_check")?
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let ok = results.len() == 1 && results[0] == "ok";
    Ok((ok, results.join("; ")))
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64> {
    let count: i64 = conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |r| r.get(0))?;
    Ok(count as u64)
}

/// Run `PRAGMA integrity_check` and gather row counts.
pub fn check_database_health(conn: &Connection) -> Result<DatabaseHealth> {
    let (integrity_ok, integrity_details) = integrity_check(conn)?;
    Ok(DatabaseHealth {
        integrity_ok,
        integrity_details,
        schema_version: migrations::get_schema_version(conn)?,
        memory_count: count_rows(conn, "memories")?,
        symbol_count: count_rows(conn, "symbols")?,
        log_count: count_rows(conn, "memory_log")?,
    })
}

pub fn check_vector_database_health(conn: &Connection) -> Result<VectorDatabaseHealth> {
    let (integrity_ok, integrity_details) = integrity_check(conn)?;
    let sqlite_vec_version: String = conn.query_row("SELECT vec_version()", [], |r| r.get(0))?;
    Ok(VectorDatabaseHealth {
        integrity_ok,
        integrity_details,
        sqlite_vec_version,
        embedding_model: migrations::get_embedding_model(conn)?,
        vector_count: count_rows(conn, "memories_vec")?,
        document_count: count_rows(conn, "vector_documents")?,
    })
}
