//! Bulk code-symbol index on the relational backend.
//!
//! Symbols (`name`, `kind`, `file_path`, `line`, `signature`) are written in
//! batched transactions and looked up by exact name or name prefix, which is
//! far cheaper in tokens than reading whole files back into context.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::backend::{RelationalStore, RetryPolicy, SymbolQuery, SymbolRow};
use crate::error::{BackendKind, MemoryError, Result};
use crate::memory::tiered::{BulkIndexReport, ItemFailure};

pub struct SymbolIndex {
    relational: Arc<dyn RelationalStore>,
    retry: RetryPolicy,
    batch_size: usize,
}

impl SymbolIndex {
    pub fn new(relational: Arc<dyn RelationalStore>, retry: RetryPolicy, batch_size: usize) -> Self {
        Self {
            relational,
            retry,
            batch_size: batch_size.max(1),
        }
    }

    /// Index symbols in batches. A failed batch is replayed row by row so
    /// only the offending rows are reported.
    pub fn index(&self, symbols: &[SymbolRow], cancel: &CancellationToken) -> BulkIndexReport {
        let mut report = BulkIndexReport::default();

        let valid: Vec<SymbolRow> = symbols
            .iter()
            .filter(|symbol| match validate(symbol) {
                Ok(()) => true,
                Err(e) => {
                    report.failed += 1;
                    report.errors.push(ItemFailure {
                        id: symbol_key(symbol),
                        backend: None,
                        message: e.to_string(),
                    });
                    false
                }
            })
            .cloned()
            .collect();

        for batch in valid.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.batches += 1;

            match self.write(batch) {
                Ok(written) => report.indexed += written,
                Err(e) => {
                    tracing::warn!(error = %e, rows = batch.len(), "symbol batch failed, retrying row by row");
                    for symbol in batch {
                        match self.write(std::slice::from_ref(symbol)) {
                            Ok(written) => report.indexed += written,
                            Err(e) => {
                                report.failed += 1;
                                report.errors.push(ItemFailure {
                                    id: symbol_key(symbol),
                                    backend: e.backend(),
                                    message: e.to_string(),
                                });
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(
            indexed = report.indexed,
            failed = report.failed,
            batches = report.batches,
            cancelled = report.cancelled,
            "symbols indexed"
        );
        report
    }

    /// Symbols named exactly `name`, optionally of one `kind`.
    pub fn lookup(&self, name: &str, kind: Option<&str>, limit: usize) -> Result<Vec<SymbolRow>> {
        self.find(SymbolQuery {
            name: name.to_string(),
            prefix: false,
            kind: kind.map(str::to_string),
            limit,
        })
    }

    /// Symbols whose name starts with `prefix`.
    pub fn lookup_prefix(&self, prefix: &str, kind: Option<&str>, limit: usize) -> Result<Vec<SymbolRow>> {
        self.find(SymbolQuery {
            name: prefix.to_string(),
            prefix: true,
            kind: kind.map(str::to_string),
            limit,
        })
    }

    fn find(&self, query: SymbolQuery) -> Result<Vec<SymbolRow>> {
        if query.name.is_empty() {
            return Err(MemoryError::validation("symbol name must not be empty"));
        }
        self.retry.run(BackendKind::Relational, "find_symbols", || {
            self.relational.find_symbols(&query)
        })
    }

    fn write(&self, batch: &[SymbolRow]) -> Result<usize> {
        self.retry.run(BackendKind::Relational, "upsert_symbols", || {
            self.relational.upsert_symbols(batch)
        })
    }
}

fn validate(symbol: &SymbolRow) -> Result<()> {
    if symbol.name.trim().is_empty() || symbol.file_path.trim().is_empty() {
        return Err(MemoryError::validation("symbol name and file path are required"));
    }
    if symbol.kind.trim().is_empty() {
        return Err(MemoryError::validation("symbol kind is required"));
    }
    Ok(())
}

fn symbol_key(symbol: &SymbolRow) -> String {
    format!("{}:{}:{}", symbol.file_path, symbol.line, symbol.name)
}
