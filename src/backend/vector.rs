//! sqlite-vec implementation of [`VectorStore`].
//!
//! Embeddings live in the `memories_vec` vec0 table; the document text and its
//! metadata live in `vector_documents`. Unfiltered queries use the vec0 KNN
//! index. Filtered queries scan the matching documents with
//! `vec_distance_l2` so the filter never starves the result set, and so do
//! unfiltered queries asking for more than vec0's `k` limit.

use rusqlite::types::ToSql;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use super::{embedding_to_bytes, VectorDocument, VectorFilter, VectorHit, VectorStore};
use crate::error::{BackendError, BackendKind, BackendResult};
use crate::memory::types::{Metadata, MetadataValue};

/// Largest `k` the vec0 KNN index accepts.
pub const VEC0_MAX_K: usize = 4096;

pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
    dimensions: usize,
}

impl SqliteVectorStore {
    /// Wrap an initialized connection (see [`crate::db::open_vector_database`]).
    pub fn new(conn: Connection, dimensions: usize) -> Self {
        Self {
            conn: Mutex::new(conn),
            dimensions,
        }
    }

    pub fn open(path: impl AsRef<Path>, dimensions: usize, model: &str) -> anyhow::Result<Self> {
        Ok(Self::new(
            crate::db::open_vector_database(path, dimensions, model)?,
            dimensions,
        ))
    }

    pub fn open_in_memory(dimensions: usize) -> anyhow::Result<Self> {
        Ok(Self::new(
            crate::db::open_memory_vector_database(dimensions)?,
            dimensions,
        ))
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> BackendResult<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| BackendError::permanent(BackendKind::Vector, "connection lock poisoned"))?;
        f(&mut conn).map_err(|e| BackendError::from_sqlite(BackendKind::Vector, e))
    }

    fn check_dimensions(&self, vector: &[f32]) -> BackendResult<()> {
        if vector.len() != self.dimensions {
            return Err(BackendError::permanent(
                BackendKind::Vector,
                format!(
                    "expected {}-dimensional vector, got {}",
                    self.dimensions,
                    vector.len()
                ),
            ));
        }
        Ok(())
    }
}

impl VectorStore for SqliteVectorStore {
    fn upsert(
        &self,
        id: &str,
        vector: &[f32],
        document: &str,
        metadata: &Metadata,
    ) -> BackendResult<()> {
        self.check_dimensions(vector)?;
        let metadata_json = metadata_to_json(metadata)?;

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            // vec0 has no upsert; replace the row
            tx.execute("DELETE FROM memories_vec WHERE id = ?1", [id])?;
            tx.execute(
                "INSERT INTO memories_vec (id, embedding) VALUES (?1, ?2)",
                params![id, embedding_to_bytes(vector)],
            )?;
            tx.execute(
                "INSERT INTO vector_documents (id, document, metadata) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(id) DO UPDATE SET document = excluded.document, \
                 metadata = excluded.metadata",
                params![id, document, metadata_json],
            )?;
            tx.commit()
        })
    }

    fn query(
        &self,
        vector: &[f32],
        filter: Option<&VectorFilter>,
        k: usize,
    ) -> BackendResult<Vec<VectorHit>> {
        self.check_dimensions(vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let bytes = embedding_to_bytes(vector);

        let hits = match filter.filter(|f| !f.equals.is_empty()) {
            None if k > VEC0_MAX_K => self.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, vec_distance_l2(embedding, ?1) AS distance FROM memories_vec \
                     ORDER BY distance, id LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![bytes, k as i64], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })?,
            None => self.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, distance FROM memories_vec \
                     WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![bytes, k as i64], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })?,
            Some(filter) => {
                let (clause, mut values) = filter_clause(filter, 1);
                values.insert(0, Box::new(bytes.to_vec()));
                values.push(Box::new(k as i64));
                let sql = format!(
                    "SELECT v.id, vec_distance_l2(v.embedding, ?1) AS distance \
                     FROM memories_vec v JOIN vector_documents d ON d.id = v.id \
                     WHERE {clause} ORDER BY distance, v.id LIMIT ?{}",
                    values.len()
                );
                self.with_conn(|conn| {
                    let mut stmt = conn.prepare(&sql)?;
                    let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
                    let rows = stmt
                        .query_map(params.as_slice(), |row| {
                            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(rows)
                })?
            }
        };

        Ok(hits
            .into_iter()
            .map(|(id, distance)| VectorHit {
                id,
                similarity: distance_to_cosine(distance),
            })
            .collect())
    }

    fn get_all(
        &self,
        filter: Option<&VectorFilter>,
        limit: Option<usize>,
    ) -> BackendResult<Vec<VectorDocument>> {
        let (clause, mut values) = match filter {
            Some(f) if !f.equals.is_empty() => filter_clause(f, 0),
            _ => ("1 = 1".to_string(), Vec::new()),
        };
        let mut sql = format!(
            "SELECT d.id, d.document, d.metadata FROM vector_documents d \
             WHERE {clause} ORDER BY d.id"
        );
        if let Some(limit) = limit {
            values.push(Box::new(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    let metadata: String = row.get(2)?;
                    Ok(VectorDocument {
                        id: row.get(0)?,
                        document: row.get(1)?,
                        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    fn update_metadata(&self, id: &str, metadata: &Metadata) -> BackendResult<bool> {
        let metadata_json = metadata_to_json(metadata)?;
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE vector_documents SET metadata = ?2 WHERE id = ?1",
                params![id, metadata_json],
            )?;
            Ok(changed == 1)
        })
    }

    fn delete(&self, id: &str) -> BackendResult<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM memories_vec WHERE id = ?1", [id])?;
            let removed = tx.execute("DELETE FROM vector_documents WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(removed == 1)
        })
    }

    fn count(&self) -> BackendResult<u64> {
        self.with_conn(|conn| {
            let count: i64 =
                conn.query_row("SELECT count(*) FROM vector_documents", [], |r| r.get(0))?;
            Ok(count as u64)
        })
    }
}

/// Cosine similarity of two unit vectors from their L2 distance.
pub fn distance_to_cosine(distance: f64) -> f64 {
    (1.0 - distance * distance / 2.0).clamp(-1.0, 1.0)
}

fn metadata_to_json(metadata: &Metadata) -> BackendResult<String> {
    serde_json::to_string(metadata)
        .map_err(|e| BackendError::permanent(BackendKind::Vector, format!("metadata: {e}")))
}

/// SQL predicate over `d.metadata` for `filter`, numbering parameters after `offset`.
fn filter_clause(filter: &VectorFilter, offset: usize) -> (String, Vec<Box<dyn ToSql>>) {
    let mut clauses = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    for (key, value) in &filter.equals {
        let path = format!("$.\"{}\"", key.replace('"', "\\\""));
        values.push(Box::new(path));
        let path_idx = offset + values.len();

        match value {
            MetadataValue::Null => {
                clauses.push(format!(
                    "coalesce(json_type(d.metadata, ?{path_idx}), 'null') = 'null'"
                ));
            }
            MetadataValue::Bool(b) => {
                values.push(Box::new(*b as i64));
                clauses.push(format!(
                    "json_extract(d.metadata, ?{path_idx}) = ?{}",
                    offset + values.len()
                ));
            }
            MetadataValue::Number(n) => {
                values.push(Box::new(*n));
                clauses.push(format!(
                    "json_extract(d.metadata, ?{path_idx}) = ?{}",
                    offset + values.len()
                ));
            }
            MetadataValue::String(s) => {
                values.push(Box::new(s.clone()));
                clauses.push(format!(
                    "json_extract(d.metadata, ?{path_idx}) = ?{}",
                    offset + values.len()
                ));
            }
        }
    }

    (clauses.join(" AND "), values)
}
