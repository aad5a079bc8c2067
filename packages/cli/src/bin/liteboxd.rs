use clap::{Parser, Subcommand};
use colored::*;
use liteboxd_cli::{Runtime, SubstrateKind};
use std::process;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::prepull::PrepullCommands;
use cli::reconcile::ReconcileCommands;
use cli::sandbox::SandboxCommands;
use cli::template::TemplateCommands;

#[derive(Parser)]
#[command(name = "liteboxd")]
#[command(about = "liteboxd - sandbox control plane")]
#[command(version)]
struct Cli {
    /// Where sandbox workloads run
    #[arg(long, value_enum, global = true, default_value = "docker")]
    substrate: SubstrateKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconcile loop and the prepull worker until ctrl-c
    Serve,
    /// Trigger and inspect reconcile runs
    #[command(subcommand)]
    Reconcile(ReconcileCommands),
    /// Create, inspect and delete sandboxes
    #[command(subcommand)]
    Sandbox(SandboxCommands),
    /// Manage versioned sandbox templates
    #[command(subcommand)]
    Template(TemplateCommands),
    /// Stage images on substrate nodes
    #[command(subcommand)]
    Prepull(PrepullCommands),
    /// Delete audit records and reclaimed sandboxes older than the cutoff
    Purge {
        #[arg(long)]
        older_than_days: u32,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    if let Err(e) = handle_command(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(cli: Cli) -> anyhow::Result<()> {
    let runtime = Runtime::init(cli.substrate).await?;

    match cli.command {
        Commands::Serve => cli::serve::serve(runtime).await,
        Commands::Reconcile(cmd) => cli::reconcile::handle_reconcile_command(cmd, &runtime).await,
        Commands::Sandbox(cmd) => cli::sandbox::handle_sandbox_command(cmd, &runtime).await,
        Commands::Template(cmd) => cli::template::handle_template_command(cmd, &runtime).await,
        Commands::Prepull(cmd) => cli::prepull::handle_prepull_command(cmd, &runtime).await,
        Commands::Purge { older_than_days } => cli::purge::purge(&runtime, older_than_days).await,
    }
}
