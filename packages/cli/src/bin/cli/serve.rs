// ABOUTME: Long-running control plane process: scheduled reconciliation plus the prepull worker
// ABOUTME: Runs until ctrl-c, then stops both loops and closes the state store

use anyhow::{Context, Result};
use colored::*;
use liteboxd_cli::Runtime;
use liteboxd_sandbox::{PrepullWorker, ReconcileLoop};
use tracing::info;

pub async fn serve(mut runtime: Runtime) -> Result<()> {
    let reports = runtime
        .take_reports()
        .context("Prepull report channel already taken")?;

    let reconcile_loop = ReconcileLoop::new(
        runtime.plane.reconciler.clone(),
        runtime.config.reconcile_interval,
    );
    let prepull_worker = PrepullWorker::new(
        runtime.plane.prepull.clone(),
        reports,
        runtime.config.prepull_sweep_interval,
    );

    reconcile_loop.start().await;
    prepull_worker.start().await;

    println!("{}", "liteboxd control plane running".green().bold());
    println!(
        "Reconciling every {}s, prepull sweep every {}s. Press Ctrl+C to stop.",
        runtime.config.reconcile_interval.as_secs(),
        runtime.config.prepull_sweep_interval.as_secs()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    info!("Shutting down");
    reconcile_loop.stop().await;
    prepull_worker.stop().await;
    runtime.pool.close().await;

    Ok(())
}
