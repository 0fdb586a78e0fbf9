//! CLI `health` command: run the Health Monitor and check database integrity.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::config::TierMemConfig;
use crate::db::{self, DatabaseHealth, VectorDatabaseHealth};
use crate::health::{HealthReport, StageOutcome};
use crate::system::TierMem;

use super::format_bytes;

#[derive(Serialize)]
struct JsonOutput<'a> {
    report: &'a HealthReport,
    database: &'a DatabaseHealth,
    vector_database: &'a VectorDatabaseHealth,
}

pub fn health(config: TierMemConfig, json: bool) -> Result<()> {
    let db_path = config.resolved_db_path();
    let vector_path = config.resolved_vector_db_path();
    let model = config.embedding.model.clone();

    let system = TierMem::open(config)?;
    let report = system.health.run(&CancellationToken::new());

    let conn = db::open_database(&db_path).context("failed to open database (may be corrupt)")?;
    let database = db::check_database_health(&conn).context("failed to check relational database")?;
    let vconn = db::open_vector_database(&vector_path, system.dimensions, &model)
        .context("failed to open vector database (may be corrupt)")?;
    let vector_database =
        db::check_vector_database_health(&vconn).context("failed to check vector database")?;

    if json {
        let output = JsonOutput {
            report: &report,
            database: &database,
            vector_database: &vector_database,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("TierMem Health Report");
    println!("=====================");
    println!();
    print_databases(&db_path, &vector_path, &database, &vector_database, &model);
    print_report(&report);
    Ok(())
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn print_databases(
    db_path: &Path,
    vector_path: &Path,
    database: &DatabaseHealth,
    vector_database: &VectorDatabaseHealth,
    model: &str,
) {
    println!("Relational database: {}", db_path.display());
    println!("  File size:         {}", format_bytes(file_size(db_path)));
    println!("  Schema version:    {}", database.schema_version);
    println!("  Memories:          {}", database.memory_count);
    println!("  Symbols:           {}", database.symbol_count);
    println!("  Audit log:         {}", database.log_count);
    println!("  Integrity:         {}", integrity(database.integrity_ok, &database.integrity_details));
    println!();
    println!("Vector database:     {}", vector_path.display());
    println!("  File size:         {}", format_bytes(file_size(vector_path)));
    println!("  sqlite-vec:        v{}", vector_database.sqlite_vec_version);
    println!("  Vectors:           {}", vector_database.vector_count);
    println!("  Documents:         {}", vector_database.document_count);
    println!(
        "  Embedding model:   {} (configured: {model})",
        vector_database.embedding_model.as_deref().unwrap_or("(not set)")
    );
    println!(
        "  Integrity:         {}",
        integrity(vector_database.integrity_ok, &vector_database.integrity_details)
    );
    if database.memory_count != vector_database.document_count {
        println!(
            "  WARNING: {} memories but {} vector documents; a write was left partial.",
            database.memory_count, vector_database.document_count
        );
    }
    println!();
}

fn integrity(ok: bool, details: &str) -> String {
    if ok {
        "PASSED".into()
    } else {
        format!("FAILED ({details})")
    }
}

fn stage_line(name: &str, outcome: &StageOutcome, summary: String) {
    let mut flags = Vec::new();
    if outcome.sampled {
        flags.push("sampled");
    }
    if outcome.budget_exhausted {
        flags.push("budget exhausted");
    }
    if outcome.skipped {
        flags.push("skipped");
    }
    let flags = if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join(", "))
    };
    println!("  {name:<15} {:<8} {summary}{flags}", outcome.status);
    if let Some(ref error) = outcome.error {
        println!("  {:<15} error: {error}", "");
    }
}

fn print_report(report: &HealthReport) {
    println!("Overall status:      {}", report.overall_status);
    if let Some(ref stats) = report.store_stats {
        let tiers: Vec<String> = stats.by_tier.iter().map(|(t, n)| format!("{t}={n}")).collect();
        println!("Memories:            {} ({})", stats.total, tiers.join(", "));
    }
    println!();
    println!("Stages:");

    let f = &report.fragmentation;
    stage_line(
        "fragmentation",
        &f.outcome,
        format!("{:.1}% of {} memories after gaps over {}s", f.percentage, f.total, f.gap_threshold_secs),
    );
    let d = &report.duplicates;
    stage_line(
        "duplicates",
        &d.outcome,
        format!("{} duplicates in {} groups ({} of {} compared)", d.duplicate_count, d.groups.len(), d.sample_size, d.total),
    );
    let o = &report.orphans;
    stage_line(
        "orphans",
        &o.outcome,
        format!("{} orphaned of {} scanned", o.orphans.len(), o.scanned),
    );
    let p = &report.performance;
    stage_line(
        "performance",
        &p.outcome,
        format!("avg {:.1}ms, max {:.1}ms over {} queries", p.avg_query_ms, p.max_query_ms, p.samples),
    );

    println!();
    println!("Recommendations:");
    for rec in &report.recommendations {
        println!("  [{:?}] {}", rec.priority, rec.message);
    }
    if report.cancelled {
        println!();
        println!("Run cancelled; skipped stages report unknown.");
    }
}
