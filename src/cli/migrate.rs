//! CLI `migrate` command: run one tier migration cycle and print the report.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::TierMemConfig;
use crate::memory::tiered::MigrationReport;
use crate::system::TierMem;

pub fn migrate(config: TierMemConfig, json: bool) -> Result<()> {
    let system = TierMem::open(config)?;

    println!("Running migration cycle...");
    let report = system.store.migrate(&CancellationToken::new());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &MigrationReport) {
    println!(
        "{:<22} {:>10} {:>10} {:>8} {:>8}",
        "Step", "Considered", "Migrated", "Failed", "Over cap"
    );
    println!("{}", "-".repeat(62));
    for step in &report.steps {
        println!(
            "{:<22} {:>10} {:>10} {:>8} {:>8}",
            format!("{} -> {}", step.from, step.to),
            step.considered,
            step.migrated,
            step.failed,
            step.over_cap
        );
    }

    for step in &report.steps {
        for failure in &step.errors {
            println!("  failed {}: {}", failure.id, failure.message);
        }
    }
    if let Some(over) = report.long_term_over_cap {
        println!("WARNING: long_term is {over} over its cap; nothing migrates out of long_term.");
    }
    if report.cancelled {
        println!("Cycle cancelled; the report is partial.");
    }

    println!(
        "Migrated {} of {} eligible memories.",
        report.total_migrated(),
        report.total_considered()
    );
}
