//! SQLite implementation of [`RelationalStore`].
//!
//! One connection behind a mutex. Every write keeps `memories_fts` (external
//! content FTS5, rowid-linked) and `memory_metadata` in step with `memories`
//! inside the same transaction, and leaves a row in `memory_log`.

use chrono::{DateTime, Utc};
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use super::{
    ExactField, ExactQuery, ListFilter, ListOrder, RelationalStore, StoreStats, SymbolQuery,
    SymbolRow,
};
use crate::error::{BackendError, BackendKind, BackendResult};
use crate::memory::types::{format_timestamp, parse_timestamp, Memory, Metadata, Tier};

const MEMORY_COLUMNS: &str = "m.id, m.content, m.context, m.importance, m.tier, \
     m.created_at, m.last_accessed_at, m.access_count, m.metadata";

pub struct SqliteRelationalStore {
    conn: Mutex<Connection>,
}

impl SqliteRelationalStore {
    /// Wrap an initialized connection (see [`crate::db::open_database`]).
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(crate::db::open_database(path)?))
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(crate::db::open_memory_database()?))
    }

    /// Run `f` against the connection, classifying failures.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> BackendResult<T> {
        let mut conn = self.conn.lock().map_err(|_| {
            BackendError::permanent(BackendKind::Relational, "connection lock poisoned")
        })?;
        f(&mut conn).map_err(|e| BackendError::from_sqlite(BackendKind::Relational, e))
    }
}

impl RelationalStore for SqliteRelationalStore {
    fn upsert_memory(&self, memory: &Memory) -> BackendResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            write_memory(&tx, memory)?;
            tx.commit()
        })
    }

    fn upsert_many(&self, memories: &[Memory]) -> BackendResult<usize> {
        if memories.is_empty() {
            return Ok(0);
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for memory in memories {
                write_memory(&tx, memory)?;
            }
            tx.commit()?;
            Ok(memories.len())
        })
    }

    fn exact_search(&self, query: &ExactQuery) -> BackendResult<Vec<Memory>> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| match &query.field {
            ExactField::Content => fts_search(conn, &query.text, query.limit),
            ExactField::Context => {
                let context = query.text.trim().to_lowercase();
                let sql = format!(
                    "SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.context = ?1 \
                     ORDER BY m.last_accessed_at DESC, m.id LIMIT ?2"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![context, query.limit as i64], memory_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            }
            ExactField::Metadata(key) => {
                let sql = format!(
                    "SELECT {MEMORY_COLUMNS} FROM memory_metadata mm \
                     JOIN memories m ON m.id = mm.memory_id \
                     WHERE mm.key = ?1 AND mm.value = ?2 \
                     ORDER BY m.last_accessed_at DESC, m.id LIMIT ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![key, query.text, query.limit as i64], memory_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            }
        })
    }

    fn get(&self, id: &str) -> BackendResult<Option<Memory>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.id = ?1"),
                [id],
                memory_from_row,
            )
            .optional()
        })
    }

    fn get_many(&self, ids: &[String]) -> BackendResult<Vec<Memory>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut found = self.with_conn(|conn| fetch_memories(conn, ids))?;
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    fn list(&self, filter: &ListFilter) -> BackendResult<Vec<Memory>> {
        let mut clauses = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(tier) = filter.tier {
            values.push(Box::new(tier.as_str()));
            clauses.push(format!("m.tier = ?{}", values.len()));
        }
        if let Some(before) = filter.created_before {
            values.push(Box::new(format_timestamp(before)));
            clauses.push(format!("m.created_at < ?{}", values.len()));
        }

        let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM memories m");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(match filter.order {
            ListOrder::CreatedAsc => " ORDER BY m.created_at ASC, m.id ASC",
            ListOrder::CreatedDesc => " ORDER BY m.created_at DESC, m.id ASC",
            ListOrder::LeastRecentlyAccessed => {
                " ORDER BY m.last_accessed_at ASC, m.importance ASC, m.id ASC"
            }
        });
        if let Some(limit) = filter.limit {
            values.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let rows = stmt
                .query_map(params.as_slice(), memory_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn count_by_tier(&self) -> BackendResult<BTreeMap<Tier, u64>> {
        let counts = self.with_conn(|conn| group_counts(conn, "tier"))?;
        Ok(Tier::ALL
            .iter()
            .map(|tier| (*tier, counts.get(tier.as_str()).copied().unwrap_or(0)))
            .collect())
    }

    fn set_tier(&self, id: &str, from: Tier, to: Tier) -> BackendResult<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE memories SET tier = ?3 WHERE id = ?1 AND tier = ?2",
                params![id, from.as_str(), to.as_str()],
            )?;
            if changed == 1 {
                let details = serde_json::json!({ "from": from.as_str(), "to": to.as_str() });
                write_audit_log(&tx, "migrate", id, Some(&details))?;
            }
            tx.commit()?;
            Ok(changed == 1)
        })
    }

    fn record_access(&self, id: &str, at: DateTime<Utc>) -> BackendResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?2 \
                 WHERE id = ?1",
                params![id, format_timestamp(at)],
            )?;
            Ok(())
        })
    }

    fn merge_stats(
        &self,
        id: &str,
        importance: f64,
        accesses: u32,
        last_accessed_at: DateTime<Utc>,
    ) -> BackendResult<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            // Fixed-width RFC 3339 strings compare in time order
            let changed = tx.execute(
                "UPDATE memories SET importance = MAX(importance, ?2), \
                 access_count = access_count + ?3, \
                 last_accessed_at = MAX(last_accessed_at, ?4) \
                 WHERE id = ?1",
                params![id, importance, accesses, format_timestamp(last_accessed_at)],
            )?;
            if changed == 1 {
                let details = serde_json::json!({ "importance": importance, "accesses": accesses });
                write_audit_log(&tx, "consolidate", id, Some(&details))?;
            }
            tx.commit()?;
            Ok(changed == 1)
        })
    }

    fn delete(&self, id: &str) -> BackendResult<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let existing: Option<(i64, String)> = tx
                .query_row(
                    "SELECT rowid, content FROM memories WHERE id = ?1",
                    [id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((rowid, content)) = existing else {
                return Ok(false);
            };

            // External content table requires the special delete command
            tx.execute(
                "INSERT INTO memories_fts(memories_fts, rowid, content) VALUES('delete', ?1, ?2)",
                params![rowid, content],
            )?;
            write_audit_log(&tx, "delete", id, None)?;
            // Cascades to memory_metadata via FK
            tx.execute("DELETE FROM memories WHERE id = ?1", [id])?;

            tx.commit()?;
            Ok(true)
        })
    }

    fn upsert_symbols(&self, symbols: &[SymbolRow]) -> BackendResult<usize> {
        if symbols.is_empty() {
            return Ok(0);
        }
        let now = format_timestamp(Utc::now());
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO symbols (name, kind, file_path, line, signature, indexed_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                     ON CONFLICT(file_path, line, name) DO UPDATE SET \
                     kind = excluded.kind, signature = excluded.signature, \
                     indexed_at = excluded.indexed_at",
                )?;
                for symbol in symbols {
                    stmt.execute(params![
                        symbol.name,
                        symbol.kind,
                        symbol.file_path,
                        symbol.line,
                        symbol.signature,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(symbols.len())
        })
    }

    fn find_symbols(&self, query: &SymbolQuery) -> BackendResult<Vec<SymbolRow>> {
        let name_clause = if query.prefix {
            "name GLOB ?1"
        } else {
            "name = ?1"
        };
        let pattern = if query.prefix {
            format!("{}*", escape_glob(&query.name))
        } else {
            query.name.clone()
        };
        let sql = format!(
            "SELECT name, kind, file_path, line, signature FROM symbols \
             WHERE {name_clause} AND (?2 IS NULL OR kind = ?2) \
             ORDER BY name, file_path, line LIMIT ?3"
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![pattern, query.kind, query.limit as i64], |row| {
                    Ok(SymbolRow {
                        name: row.get(0)?,
                        kind: row.get(1)?,
                        file_path: row.get(2)?,
                        line: row.get(3)?,
                        signature: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn stats(&self) -> BackendResult<StoreStats> {
        self.with_conn(|conn| {
            let total: i64 = conn.query_row("SELECT count(*) FROM memories", [], |r| r.get(0))?;
            let (oldest, newest): (Option<String>, Option<String>) = conn.query_row(
                "SELECT MIN(created_at), MAX(created_at) FROM memories",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            let symbol_count: i64 =
                conn.query_row("SELECT count(*) FROM symbols", [], |r| r.get(0))?;

            let mut by_tier = group_counts(conn, "tier")?;
            for tier in Tier::ALL {
                by_tier.entry(tier.as_str().to_string()).or_insert(0);
            }

            Ok(StoreStats {
                total: total as u64,
                by_tier,
                by_context: group_counts(conn, "context")?,
                oldest: oldest.as_deref().and_then(parse_timestamp),
                newest: newest.as_deref().and_then(parse_timestamp),
                symbol_count: symbol_count as u64,
            })
        })
    }
}

// ── Internal helpers ──────────────────────────────────────────────────────────

/// Upsert one memory row plus its FTS and metadata index rows.
fn write_memory(tx: &Transaction, memory: &Memory) -> rusqlite::Result<()> {
    let previous: Option<(i64, String)> = tx
        .prepare_cached("SELECT rowid, content FROM memories WHERE id = ?1")?
        .query_row([&memory.id], |row| Ok((row.get(0)?, row.get(1)?)))
        .optional()?;

    if let Some((rowid, content)) = &previous {
        tx.prepare_cached(
            "INSERT INTO memories_fts(memories_fts, rowid, content) VALUES('delete', ?1, ?2)",
        )?
        .execute(params![rowid, content])?;
    }

    let metadata_json = serde_json::to_string(&memory.metadata)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    tx.prepare_cached(
        "INSERT INTO memories (id, content, context, importance, tier, created_at, \
         last_accessed_at, access_count, metadata) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
         ON CONFLICT(id) DO UPDATE SET content = excluded.content, \
         context = excluded.context, importance = excluded.importance, \
         tier = excluded.tier, created_at = excluded.created_at, \
         last_accessed_at = excluded.last_accessed_at, \
         access_count = excluded.access_count, metadata = excluded.metadata",
    )?
    .execute(params![
        memory.id,
        memory.content,
        memory.context.as_str(),
        memory.importance,
        memory.tier.as_str(),
        format_timestamp(memory.created_at),
        format_timestamp(memory.last_accessed_at),
        memory.access_count,
        metadata_json,
    ])?;

    // ON CONFLICT DO UPDATE keeps the rowid, so FTS stays linked
    let rowid: i64 = tx
        .prepare_cached("SELECT rowid FROM memories WHERE id = ?1")?
        .query_row([&memory.id], |row| row.get(0))?;
    tx.prepare_cached("INSERT INTO memories_fts (rowid, content) VALUES (?1, ?2)")?
        .execute(params![rowid, memory.content])?;

    tx.prepare_cached("DELETE FROM memory_metadata WHERE memory_id = ?1")?
        .execute([&memory.id])?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO memory_metadata (memory_id, key, value) VALUES (?1, ?2, ?3)",
        )?;
        for (key, value) in &memory.metadata {
            stmt.execute(params![memory.id, key, value.as_index_text()])?;
        }
    }

    let operation = if previous.is_some() { "update" } else { "create" };
    write_audit_log(tx, operation, &memory.id, None)
}

/// FTS5 BM25 keyword search, joined back to the canonical rows.
fn fts_search(conn: &Connection, query_text: &str, limit: usize) -> rusqlite::Result<Vec<Memory>> {
    let escaped = escape_fts_query(query_text);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories_fts \
         JOIN memories m ON m.rowid = memories_fts.rowid \
         WHERE memories_fts MATCH ?1 ORDER BY rank LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![escaped, limit as i64], memory_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Escape a user query for FTS5 MATCH syntax.
///
/// Wraps each whitespace-delimited word in double quotes and joins with spaces
/// so FTS5 treats them as individual terms (implicit AND). Strips empty tokens.
pub(crate) fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| {
            let clean = word.replace('"', "");
            format!("\"{clean}\"")
        })
        .filter(|w| w != "\"\"")
        .collect::<Vec<_>>()
        .join(" ")
}

/// Make GLOB metacharacters literal.
fn escape_glob(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '*' | '?' | '[' => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Batch-fetch memory records by IDs.
fn fetch_memories(conn: &Connection, ids: &[String]) -> rusqlite::Result<HashMap<String, Memory>> {
    // Build a parameterized IN clause
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.id IN ({})",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn ToSql> = ids.iter().map(|id| id as &dyn ToSql).collect();
    let rows = stmt
        .query_map(params.as_slice(), memory_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows.into_iter().map(|m| (m.id.clone(), m)).collect())
}

fn group_counts(conn: &Connection, column: &str) -> rusqlite::Result<BTreeMap<String, u64>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {column}, count(*) FROM memories GROUP BY {column}"
    ))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let metadata_str: Option<String> = row.get(8)?;
    let metadata: Metadata = metadata_str
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Ok(Memory {
        id: row.get(0)?,
        content: row.get(1)?,
        context: parse_column(row, 2)?,
        importance: row.get(3)?,
        tier: parse_column(row, 4)?,
        created_at: timestamp_column(row, 5)?,
        last_accessed_at: timestamp_column(row, 6)?,
        access_count: row.get(7)?,
        metadata,
    })
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("invalid timestamp: {raw}").into(),
        )
    })
}

/// Write an entry to the memory_log audit table.
fn write_audit_log(
    conn: &Connection,
    operation: &str,
    memory_id: &str,
    details: Option<&serde_json::Value>,
) -> rusqlite::Result<()> {
    let now = format_timestamp(Utc::now());
    let details_json = details.map(|d| d.to_string());
    conn.prepare_cached(
        "INSERT INTO memory_log (operation, memory_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
    )?
    .execute(params![operation, memory_id, details_json, now])?;
    Ok(())
}
