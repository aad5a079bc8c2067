// ABOUTME: CLI commands for reconcile runs (manual trigger, run list, run detail)
// ABOUTME: A manual run executes in this process against the configured substrate

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use liteboxd_cli::output::{format_opt_time, format_time, print_json, status_cell, table, truncate};
use liteboxd_cli::Runtime;
use liteboxd_storage::ReconcileRunDetail;

#[derive(Subcommand)]
pub enum ReconcileCommands {
    /// Run one reconcile pass now
    Run {
        /// Print the full run as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recent runs, newest first
    List {
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Show one run with its items
    Show {
        /// Run ID (rec-...)
        id: String,
    },
}

pub async fn handle_reconcile_command(command: ReconcileCommands, runtime: &Runtime) -> Result<()> {
    let reconciler = &runtime.plane.reconciler;

    match command {
        ReconcileCommands::Run { json } => {
            let detail = reconciler.trigger_manual().await?;
            if json {
                print_json(&detail)
            } else {
                print_run(&detail);
                Ok(())
            }
        }
        ReconcileCommands::List { limit } => {
            let runs = reconciler.list_runs(limit).await?;
            if runs.is_empty() {
                println!("{}", "No reconcile runs yet".yellow());
                println!("{}", "Use 'liteboxd reconcile run' to trigger one".dimmed());
                return Ok(());
            }

            let mut runs_table = table(vec![
                "ID", "Trigger", "Status", "Started", "Finished", "DB", "Substrate", "Drift",
                "Fixed",
            ]);
            for run in &runs {
                runs_table.add_row(vec![
                    run.id.clone(),
                    run.trigger_type.as_str().to_string(),
                    status_cell(run.status.as_str()),
                    format_time(&run.started_at),
                    format_opt_time(run.finished_at.as_ref()),
                    run.total_db.to_string(),
                    run.total_substrate.to_string(),
                    run.drift_count.to_string(),
                    run.fixed_count.to_string(),
                ]);
            }
            println!("{}", runs_table);
            println!("Total: {} runs", runs.len().to_string().cyan());
            Ok(())
        }
        ReconcileCommands::Show { id } => print_json(&reconciler.get_run_detail(&id).await?),
    }
}

fn print_run(detail: &ReconcileRunDetail) {
    let run = &detail.run;
    println!(
        "{} {} ({})",
        "Reconcile run".blue().bold(),
        run.id,
        status_cell(run.status.as_str())
    );
    println!(
        "Observed {} sandboxes and {} workloads; {} drift, {} fixed",
        run.total_db, run.total_substrate, run.drift_count, run.fixed_count
    );
    if let Some(error) = &run.error {
        println!("{} {}", "Note:".yellow(), error);
    }
    if detail.items.is_empty() {
        return;
    }

    let mut items = table(vec!["Sandbox", "Drift", "Action", "Outcome", "Detail"]);
    for item in &detail.items {
        items.add_row(vec![
            item.sandbox_id.clone(),
            item.drift_type.as_str().to_string(),
            item.action.clone(),
            status_cell(item.outcome.as_str()),
            truncate(&item.detail, 80),
        ]);
    }
    println!("{}", items);
}
