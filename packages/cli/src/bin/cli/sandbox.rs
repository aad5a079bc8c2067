// ABOUTME: CLI commands for sandboxes (create, list, get, history, desired state, delete)
// ABOUTME: Every mutation goes through the sandbox manager and its per-sandbox lock

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use liteboxd_cli::output::{format_time, parse_env_pair, print_json, status_cell, table, truncate};
use liteboxd_cli::Runtime;
use liteboxd_sandbox::{CreateSandboxRequest, SandboxOverrides};
use liteboxd_storage::{DesiredState, LifecycleStatus, SandboxFilter};

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Create a sandbox from a template
    Create {
        #[arg(long)]
        template: String,
        /// Template version (default: latest)
        #[arg(long)]
        version: Option<i64>,
        /// CPU override, e.g. 500m or 2
        #[arg(long)]
        cpu: Option<String>,
        /// Memory override, e.g. 512Mi or 2Gi
        #[arg(long)]
        memory: Option<String>,
        /// Lifetime in seconds
        #[arg(long)]
        ttl: Option<i64>,
        /// Extra environment, repeatable
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
    },
    /// List sandboxes
    List {
        /// Match IDs starting with this prefix
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        template: Option<String>,
        /// running or deleted
        #[arg(long)]
        desired: Option<String>,
        /// pending, running, succeeded, failed, error, terminating, terminated
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        page_size: Option<u32>,
    },
    /// Show one sandbox
    Get { id: String },
    /// Show lifecycle history, newest first
    History {
        id: String,
        /// Only entries older than this history ID
        #[arg(long)]
        before_id: Option<i64>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Set the desired state (running or deleted)
    Desired { id: String, state: String },
    /// Mark deleted and terminate the workload
    Delete { id: String },
}

pub async fn handle_sandbox_command(command: SandboxCommands, runtime: &Runtime) -> Result<()> {
    let manager = &runtime.plane.manager;

    match command {
        SandboxCommands::Create {
            template,
            version,
            cpu,
            memory,
            ttl,
            env,
        } => {
            let request = CreateSandboxRequest {
                template,
                template_version: version,
                overrides: SandboxOverrides {
                    cpu,
                    memory,
                    ttl,
                    env: env.into_iter().collect(),
                },
            };
            let sandbox = manager.create_sandbox(request).await?;
            if sandbox.lifecycle_status == LifecycleStatus::Error {
                println!(
                    "{} {} was recorded but its workload did not start",
                    "Warning:".yellow().bold(),
                    sandbox.id
                );
            }
            print_json(&sandbox)
        }
        SandboxCommands::List {
            id,
            template,
            desired,
            status,
            page,
            page_size,
        } => {
            let filter = SandboxFilter {
                id_prefix: id,
                template,
                desired_state: desired.as_deref().map(DesiredState::from_str).transpose()?,
                lifecycle_status: status
                    .as_deref()
                    .map(LifecycleStatus::from_str)
                    .transpose()?,
                page,
                page_size,
                ..Default::default()
            };
            let result = manager.list_sandboxes(&filter).await?;

            if result.items.is_empty() {
                println!("{}", "No sandboxes found".yellow());
                return Ok(());
            }

            let mut sandboxes = table(vec![
                "ID", "Template", "Image", "Desired", "Status", "IP", "Expires", "Created",
            ]);
            for sandbox in &result.items {
                let template = match (&sandbox.template_name, sandbox.template_version) {
                    (Some(name), Some(version)) => format!("{}@v{}", name, version),
                    (Some(name), None) => name.clone(),
                    _ => "-".to_string(),
                };
                sandboxes.add_row(vec![
                    sandbox.id.clone(),
                    template,
                    truncate(&sandbox.image, 30),
                    sandbox.desired_state.as_str().to_string(),
                    status_cell(sandbox.lifecycle_status.as_str()),
                    sandbox.pod_ip.clone().unwrap_or_else(|| "-".to_string()),
                    format_time(&sandbox.expires_at),
                    format_time(&sandbox.created_at),
                ]);
            }
            println!("{}", sandboxes);
            println!(
                "Page {} of {} sandboxes ({} per page)",
                result.page,
                result.total.to_string().cyan(),
                result.page_size
            );
            Ok(())
        }
        SandboxCommands::Get { id } => print_json(&manager.get_sandbox(&id).await?),
        SandboxCommands::History {
            id,
            before_id,
            limit,
        } => {
            let history = manager.list_status_history(&id, before_id, limit).await?;

            let mut rows = table(vec!["#", "From", "To", "Source", "Reason", "At"]);
            for entry in &history {
                rows.add_row(vec![
                    entry.id.to_string(),
                    entry
                        .from_status
                        .map(|s| s.as_str().to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    status_cell(entry.to_status.as_str()),
                    entry.source.as_str().to_string(),
                    truncate(&entry.reason, 50),
                    format_time(&entry.created_at),
                ]);
            }
            println!("{}", rows);
            if let Some(oldest) = history.last() {
                println!(
                    "{}",
                    format!("Older entries: --before-id {}", oldest.id).dimmed()
                );
            }
            Ok(())
        }
        SandboxCommands::Desired { id, state } => {
            print_json(&manager.set_desired_state(&id, &state).await?)
        }
        SandboxCommands::Delete { id } => {
            let sandbox = manager.delete_sandbox(&id).await?;
            println!(
                "{} {} marked deleted ({})",
                "✓".green(),
                sandbox.id,
                sandbox.lifecycle_status
            );
            Ok(())
        }
    }
}
