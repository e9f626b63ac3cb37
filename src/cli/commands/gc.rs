//! GC command - run one collection pass or keep collecting

use crate::cli::args::{GcArgs, OutputFormat};
use crate::cli::output;
use crate::config::Config;
use crate::error::{ErrorKind, StoreError, StoreResult};
use crate::gc::{Collector, GcReport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Execute the gc command
pub async fn execute(args: GcArgs, config: &Config) -> StoreResult<()> {
    let db = super::open_db(config).await?;
    let collector = Arc::new(Collector::new(db, &config.check_sessions));

    if !args.watch {
        let report = run_pass(&collector, args.dry_run).await?;
        return print_report(&report, args.format);
    }

    let period = Duration::from_secs(config.gc.interval_secs.max(1));
    info!("Collecting every {}s", period.as_secs());
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_pass(&collector, args.dry_run).await {
                    Ok(report) => print_report(&report, args.format)?,
                    // Corrupt rows stop the loop; anything else is retried next tick
                    Err(e) if e.kind() != ErrorKind::Invariant => warn!("GC pass failed: {}", e),
                    Err(e) => return Err(e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                return Ok(());
            }
        }
    }
}

async fn run_pass(collector: &Arc<Collector>, dry_run: bool) -> StoreResult<GcReport> {
    let collector = Arc::clone(collector);
    tokio::task::spawn_blocking(move || collector.run_once(dry_run))
        .await
        .map_err(|e| StoreError::Internal(format!("gc task failed: {}", e)))?
}

fn print_report(report: &GcReport, format: OutputFormat) -> StoreResult<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(report)?),
        OutputFormat::Plain => {
            for (label, count) in report.entries() {
                println!("{}={}", label.replace(' ', "_"), count);
            }
        }
        OutputFormat::Table => {
            if report.dry_run {
                output::intro("Garbage collection (dry run)");
            } else {
                output::intro("Garbage collection");
            }
            for (label, count) in report.entries() {
                output::key_value(label, &count.to_string());
            }
            println!();
            if report.total() == 0 {
                output::step_ok("Nothing to collect");
            } else if report.dry_run {
                output::step_info(&format!("{} row(s) would be collected", report.total()));
            } else {
                output::step_ok(&format!("Collected {} row(s)", report.total()));
            }
        }
    }
    Ok(())
}
