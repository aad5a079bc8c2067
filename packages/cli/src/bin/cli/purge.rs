// ABOUTME: Retention command that deletes old reconcile runs, history and reclaimed sandboxes
// ABOUTME: Finished prepull tasks past the same cutoff are removed too

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use colored::*;
use liteboxd_cli::output::table;
use liteboxd_cli::Runtime;
use liteboxd_storage::ReconcileStore;

pub async fn purge(runtime: &Runtime, older_than_days: u32) -> Result<()> {
    if older_than_days == 0 {
        bail!("--older-than-days must be at least 1");
    }
    let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));

    let report = ReconcileStore::new(runtime.pool.clone())
        .purge_history_before(cutoff)
        .await?;
    let prepulls = runtime.plane.prepull.cleanup_finished(cutoff).await?;

    println!(
        "{} Purged records older than {} days",
        "✓".green(),
        older_than_days
    );
    let mut rows = table(vec!["Record", "Deleted"]);
    rows.add_row(vec!["reconcile items".to_string(), report.reconcile_items.to_string()]);
    rows.add_row(vec!["reconcile runs".to_string(), report.reconcile_runs.to_string()]);
    rows.add_row(vec!["status history".to_string(), report.status_history.to_string()]);
    rows.add_row(vec!["sandboxes".to_string(), report.sandboxes.to_string()]);
    rows.add_row(vec!["prepull tasks".to_string(), prepulls.to_string()]);
    println!("{}", rows);

    Ok(())
}
