// ABOUTME: CLI commands for sandbox templates (create, list, show, versions, rollback, delete)
// ABOUTME: Specs come from flags or a JSON file; whole templates move in and out as YAML

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use colored::*;
use liteboxd_cli::output::{
    format_time, parse_env_pair, print_json, status_cell, table, truncate,
};
use liteboxd_cli::Runtime;
use liteboxd_sandbox::{CreateTemplateRequest, ExportFilter, ImportStrategy};
use liteboxd_storage::TemplateSpec;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum TemplateCommands {
    /// Create a template with its first version
    Create {
        #[arg(long)]
        name: String,
        /// Container image; required unless --spec-file is given
        #[arg(long)]
        image: Option<String>,
        /// Full spec as JSON; flags below override its fields
        #[arg(long)]
        spec_file: Option<PathBuf>,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
        /// Comma separated
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long, default_value = "")]
        author: String,
        #[arg(long)]
        cpu: Option<String>,
        #[arg(long)]
        memory: Option<String>,
        /// Default sandbox lifetime in seconds
        #[arg(long)]
        ttl: Option<i64>,
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
        #[arg(long)]
        startup_script: Option<String>,
        #[arg(long)]
        changelog: Option<String>,
        /// Stage the image on substrate nodes
        #[arg(long)]
        prepull: bool,
    },
    /// List templates
    List {
        #[arg(long)]
        tag: Option<String>,
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "20")]
        page_size: u32,
    },
    /// Show a template and its latest spec
    Show { name: String },
    /// List every version of a template
    Versions { name: String },
    /// Append a copy of an older version as the new latest
    Rollback {
        name: String,
        version: i64,
        #[arg(long)]
        changelog: Option<String>,
    },
    /// Delete a template and all of its versions
    Delete { name: String },
    /// Load SandboxTemplate or SandboxTemplateList YAML
    Import {
        #[arg(long, short)]
        file: PathBuf,
        /// create-only, update-only or create-or-update
        #[arg(long, default_value = "create-or-update", value_parser = parse_strategy)]
        strategy: ImportStrategy,
        /// Stage each imported image on substrate nodes
        #[arg(long)]
        prepull: bool,
    },
    /// Write templates as YAML; one template when a name is given, else a list
    Export {
        name: Option<String>,
        /// Version of the named template (default: latest)
        #[arg(long, requires = "name")]
        version: Option<i64>,
        #[arg(long, conflicts_with = "name")]
        tag: Option<String>,
        /// Comma separated
        #[arg(long, value_delimiter = ',', conflicts_with = "name")]
        names: Vec<String>,
        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

pub async fn handle_template_command(command: TemplateCommands, runtime: &Runtime) -> Result<()> {
    let templates = &runtime.plane.templates;

    match command {
        TemplateCommands::Create {
            name,
            image,
            spec_file,
            display_name,
            description,
            tags,
            author,
            cpu,
            memory,
            ttl,
            env,
            startup_script,
            changelog,
            prepull,
        } => {
            let mut spec = match spec_file {
                Some(path) => read_spec(&path)?,
                None => TemplateSpec::default(),
            };
            if let Some(image) = image {
                spec.image = image;
            }
            if spec.image.trim().is_empty() {
                bail!("--image or a spec file with an image is required");
            }
            if let Some(cpu) = cpu {
                spec.resources.cpu = cpu;
            }
            if let Some(memory) = memory {
                spec.resources.memory = memory;
            }
            if let Some(ttl) = ttl {
                spec.ttl = ttl;
            }
            spec.env.extend(env);
            if startup_script.is_some() {
                spec.startup_script = startup_script;
            }

            let (template, version) = templates
                .create(CreateTemplateRequest {
                    name,
                    display_name,
                    description,
                    tags,
                    author,
                    spec,
                    changelog,
                    prepull,
                })
                .await?;
            println!(
                "{} Created template {} (v{})",
                "✓".green(),
                template.name.bold(),
                version.version
            );
            print_json(&version.spec)
        }
        TemplateCommands::List {
            tag,
            page,
            page_size,
        } => {
            let result = templates.list(tag.as_deref(), page, page_size).await?;
            if result.items.is_empty() {
                println!("{}", "No templates found".yellow());
                println!(
                    "{}",
                    "Use 'liteboxd template create --name <name> --image <image>' to add one"
                        .dimmed()
                );
                return Ok(());
            }

            let mut rows = table(vec!["Name", "Display Name", "Latest", "Tags", "Author", "Updated"]);
            for template in &result.items {
                rows.add_row(vec![
                    template.name.clone(),
                    truncate(&template.display_name, 25),
                    format!("v{}", template.latest_version),
                    truncate(&template.tags.join(", "), 25),
                    template.author.clone(),
                    format_time(&template.updated_at),
                ]);
            }
            println!("{}", rows);
            println!("Total: {} templates", result.total.to_string().cyan());
            Ok(())
        }
        TemplateCommands::Show { name } => {
            let template = templates.get(&name).await?;
            let latest = templates.get_version(&name, template.latest_version).await?;
            print_json(&serde_json::json!({
                "template": template,
                "latest": latest,
            }))
        }
        TemplateCommands::Versions { name } => {
            let versions = templates.list_versions(&name).await?;
            let mut rows = table(vec!["Version", "Image", "CPU", "Memory", "Changelog", "Created"]);
            for version in &versions {
                rows.add_row(vec![
                    format!("v{}", version.version),
                    truncate(&version.spec.image, 35),
                    version.spec.resources.cpu.clone(),
                    version.spec.resources.memory.clone(),
                    truncate(&version.changelog, 40),
                    format_time(&version.created_at),
                ]);
            }
            println!("{}", rows);
            Ok(())
        }
        TemplateCommands::Rollback {
            name,
            version,
            changelog,
        } => {
            let result = templates.rollback(&name, version, changelog).await?;
            println!(
                "{} Rolled back {} from v{} to v{} (now v{})",
                "✓".green(),
                name.bold(),
                result.rolled_back_from,
                result.rolled_back_to,
                result.version.version
            );
            Ok(())
        }
        TemplateCommands::Delete { name } => {
            templates.delete(&name).await?;
            println!("{} Deleted template {}", "✓".green(), name.bold());
            Ok(())
        }
        TemplateCommands::Import {
            file,
            strategy,
            prepull,
        } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let report = templates.import_yaml(&raw, strategy, prepull).await?;

            let mut rows = table(vec!["Name", "Action", "Version", "Error"]);
            for result in &report.results {
                rows.add_row(vec![
                    result.name.clone(),
                    status_cell(result.action.as_str()),
                    result
                        .version
                        .map(|v| format!("v{}", v))
                        .unwrap_or_else(|| "-".to_string()),
                    truncate(result.error.as_deref().unwrap_or(""), 50),
                ]);
            }
            println!("{}", rows);
            println!(
                "Import complete: {} total, {} created, {} updated, {} skipped, {} failed",
                report.total,
                report.created.to_string().green(),
                report.updated.to_string().cyan(),
                report.skipped.to_string().yellow(),
                report.failed.to_string().red()
            );
            if !report.prepull_images.is_empty() {
                println!("Prepull scheduled for: {}", report.prepull_images.join(", "));
            }
            Ok(())
        }
        TemplateCommands::Export {
            name,
            version,
            tag,
            names,
            output,
        } => {
            let yaml = match name {
                Some(name) => templates.export_yaml(&name, version).await?,
                None => templates.export_all_yaml(&ExportFilter { tag, names }).await?,
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, yaml)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("{} Exported to {}", "✓".green(), path.display());
                }
                None => print!("{}", yaml),
            }
            Ok(())
        }
    }
}

fn parse_strategy(raw: &str) -> std::result::Result<ImportStrategy, String> {
    ImportStrategy::from_str(raw).map_err(|e| e.to_string())
}

fn read_spec(path: &Path) -> Result<TemplateSpec> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read spec file {}", path.display()))?;
    let spec: TemplateSpec = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid template spec in {}", path.display()))?;
    Ok(spec)
}
