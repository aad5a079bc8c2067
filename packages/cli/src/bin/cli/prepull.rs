// ABOUTME: CLI commands for image prepull tasks (create, list, delete)
// ABOUTME: Tasks are dispatched by the prepull worker of a running `liteboxd serve`

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use liteboxd_cli::output::{format_opt_time, format_time, status_cell, table, truncate};
use liteboxd_cli::Runtime;
use liteboxd_storage::{PrepullFilter, PrepullStatus};

#[derive(Subcommand)]
pub enum PrepullCommands {
    /// Schedule an image pull on N nodes
    Create {
        image: String,
        #[arg(long, default_value = "1")]
        nodes: i64,
        /// Template the pull is staged for
        #[arg(long)]
        template: Option<String>,
    },
    /// List prepull tasks, newest first
    List {
        #[arg(long)]
        image: Option<String>,
        /// pending, running, completed or failed
        #[arg(long)]
        status: Option<String>,
    },
    /// Cancel (if active) and remove a task
    Delete { id: String },
}

pub async fn handle_prepull_command(command: PrepullCommands, runtime: &Runtime) -> Result<()> {
    let prepull = &runtime.plane.prepull;

    match command {
        PrepullCommands::Create {
            image,
            nodes,
            template,
        } => {
            let task = prepull.schedule(&image, nodes, template.as_deref()).await?;
            println!(
                "{} Scheduled prepull {} for {} on {} node(s)",
                "✓".green(),
                task.id.bold(),
                task.image,
                task.desired_nodes
            );
            println!(
                "{}",
                "A running 'liteboxd serve' dispatches it on its next sweep".dimmed()
            );
            Ok(())
        }
        PrepullCommands::List { image, status } => {
            let filter = PrepullFilter {
                image,
                status: status.as_deref().map(PrepullStatus::from_str).transpose()?,
            };
            let tasks = prepull.list(&filter).await?;
            if tasks.is_empty() {
                println!("{}", "No prepull tasks found".yellow());
                return Ok(());
            }

            let mut rows = table(vec![
                "ID", "Image", "Status", "Nodes", "Template", "Created", "Completed", "Error",
            ]);
            for task in &tasks {
                rows.add_row(vec![
                    task.id.clone(),
                    truncate(&task.image, 35),
                    status_cell(task.status.as_str()),
                    format!("{}/{}", task.ready_nodes, task.desired_nodes),
                    task.template.clone().unwrap_or_else(|| "-".to_string()),
                    format_time(&task.created_at),
                    format_opt_time(task.completed_at.as_ref()),
                    truncate(task.error.as_deref().unwrap_or("-"), 40),
                ]);
            }
            println!("{}", rows);
            Ok(())
        }
        PrepullCommands::Delete { id } => {
            prepull.delete(&id).await?;
            println!("{} Deleted prepull {}", "✓".green(), id.bold());
            Ok(())
        }
    }
}
