// ABOUTME: Template service: validation, defaults, versioned edits, rollback and auto-prepull
// ABOUTME: Every spec change appends a version; history is never rewritten

mod transfer;

pub use transfer::{
    ExportFilter, ImportAction, ImportReport, ImportResult, ImportStrategy, TemplateDocument,
    TemplateListDocument, TemplateMetadata,
};

use crate::error::{ControlError, Result};
use crate::prepull::PrepullScheduler;
use liteboxd_storage::{
    NewTemplate, Template, TemplatePatch, TemplateSpec, TemplateStore, TemplateVersion,
    MAX_TTL_SECS,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

pub const DEFAULT_CPU: &str = "500m";
pub const DEFAULT_MEMORY: &str = "512Mi";
pub const DEFAULT_TTL_SECS: i64 = 3600;
pub const DEFAULT_STARTUP_TIMEOUT_SECS: i64 = 300;

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$")
        .unwrap_or_else(|e| panic!("template name pattern does not compile: {}", e))
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub author: String,
    pub spec: TemplateSpec,
    #[serde(default)]
    pub changelog: Option<String>,
    /// Stage the image on nodes once the template exists
    #[serde(default)]
    pub prepull: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTemplateRequest {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    /// A new version is created only when a spec is supplied
    pub spec: Option<TemplateSpec>,
    #[serde(default)]
    pub changelog: Option<String>,
    #[serde(default)]
    pub prepull: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackResult {
    pub template: Template,
    pub version: TemplateVersion,
    pub rolled_back_from: i64,
    pub rolled_back_to: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplatePage {
    pub items: Vec<Template>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

pub struct TemplateService {
    store: TemplateStore,
    prepull: Option<Arc<PrepullScheduler>>,
    prepull_nodes: i64,
}

impl TemplateService {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            store: TemplateStore::new(pool),
            prepull: None,
            prepull_nodes: 1,
        }
    }

    /// Enable auto-prepull onto `nodes` nodes
    pub fn with_prepull(mut self, scheduler: Arc<PrepullScheduler>, nodes: i64) -> Self {
        self.prepull = Some(scheduler);
        self.prepull_nodes = nodes.max(1);
        self
    }

    pub async fn create(
        &self,
        request: CreateTemplateRequest,
    ) -> Result<(Template, TemplateVersion)> {
        validate_name(&request.name)?;
        let spec = prepare_spec(request.spec)?;

        let new = NewTemplate {
            display_name: request
                .display_name
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| request.name.clone()),
            name: request.name,
            description: request.description,
            tags: request.tags,
            author: request.author,
        };
        let changelog = request
            .changelog
            .unwrap_or_else(|| "Initial version".to_string());

        let (template, version) = self.store.create_template(new, &spec, &changelog).await?;
        info!("Created template {} (v{})", template.name, version.version);

        if request.prepull {
            self.auto_prepull(&template.name, &version).await;
        }
        Ok((template, version))
    }

    pub async fn update(
        &self,
        name: &str,
        request: UpdateTemplateRequest,
    ) -> Result<(Template, Option<TemplateVersion>)> {
        let spec = request.spec.map(prepare_spec).transpose()?;

        let version = match spec {
            Some(spec) => {
                let changelog = request.changelog.unwrap_or_default();
                let (_, version) = self.store.append_version(name, &spec, &changelog).await?;
                info!("Template {} now at v{}", name, version.version);
                Some(version)
            }
            None => None,
        };

        let patch = TemplatePatch {
            display_name: request.display_name,
            description: request.description,
            tags: request.tags,
        };
        let template = self.store.update_metadata(name, &patch).await?;

        if request.prepull {
            if let Some(version) = &version {
                self.auto_prepull(name, version).await;
            }
        }
        Ok((template, version))
    }

    /// Copy version `target`'s spec into a new latest version
    pub async fn rollback(
        &self,
        name: &str,
        target: i64,
        changelog: Option<String>,
    ) -> Result<RollbackResult> {
        let current = self.store.get_template(name).await?;
        if target < 1 || target > current.latest_version {
            return Err(ControlError::Validation(format!(
                "version {} out of range 1..={} for template {}",
                target, current.latest_version, name
            )));
        }

        let source = self.store.get_version(name, target).await?;
        let changelog = changelog.unwrap_or_else(|| format!("Rollback to version {}", target));
        let (template, version) = self
            .store
            .append_version(name, &source.spec, &changelog)
            .await?;

        info!(
            "Rolled back template {} to v{} as v{}",
            name, target, version.version
        );
        Ok(RollbackResult {
            template,
            version,
            rolled_back_from: current.latest_version,
            rolled_back_to: target,
        })
    }

    pub async fn get(&self, name: &str) -> Result<Template> {
        Ok(self.store.get_template(name).await?)
    }

    pub async fn list(&self, tag: Option<&str>, page: u32, page_size: u32) -> Result<TemplatePage> {
        let page = page.max(1);
        let page_size = if page_size == 0 { 20 } else { page_size.min(100) };
        let (items, total) = self.store.list_templates(tag, page, page_size).await?;
        Ok(TemplatePage {
            items,
            total,
            page,
            page_size,
        })
    }

    pub async fn list_versions(&self, name: &str) -> Result<Vec<TemplateVersion>> {
        Ok(self.store.list_versions(name).await?)
    }

    pub async fn get_version(&self, name: &str, version: i64) -> Result<TemplateVersion> {
        Ok(self.store.get_version(name, version).await?)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.store.delete_template(name).await?;
        info!("Deleted template {}", name);
        Ok(())
    }

    /// True when a prepull of the version's image is now active
    async fn auto_prepull(&self, name: &str, version: &TemplateVersion) -> bool {
        let Some(scheduler) = &self.prepull else {
            warn!("Prepull requested for template {} but no scheduler is configured", name);
            return false;
        };

        match scheduler
            .schedule(&version.spec.image, self.prepull_nodes, Some(name))
            .await
        {
            Ok(task) => {
                info!("Scheduled prepull {} for {}", task.id, version.spec.image);
                true
            }
            Err(e) if e.is_conflict() => {
                debug!("Prepull of {} already active", version.spec.image);
                true
            }
            Err(e) => {
                warn!("Failed to schedule prepull for template {}: {}", name, e);
                false
            }
        }
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(ControlError::Validation(
            "template name must be between 1 and 63 characters".to_string(),
        ));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(ControlError::Validation(format!(
            "template name '{}' must be lowercase letters, digits and hyphens, \
             starting and ending with a letter or digit",
            name
        )));
    }
    Ok(())
}

/// Fill unset sizing and timing fields
pub fn apply_defaults(spec: &mut TemplateSpec) {
    if spec.resources.cpu.trim().is_empty() {
        spec.resources.cpu = DEFAULT_CPU.to_string();
    }
    if spec.resources.memory.trim().is_empty() {
        spec.resources.memory = DEFAULT_MEMORY.to_string();
    }
    if spec.ttl == 0 {
        spec.ttl = DEFAULT_TTL_SECS;
    }
    if spec.startup_timeout == 0 {
        spec.startup_timeout = DEFAULT_STARTUP_TIMEOUT_SECS;
    }
}

fn prepare_spec(mut spec: TemplateSpec) -> Result<TemplateSpec> {
    apply_defaults(&mut spec);
    validate_spec(&mut spec)?;
    Ok(spec)
}

/// Check a spec, normalizing its allowed domains in place
pub fn validate_spec(spec: &mut TemplateSpec) -> Result<()> {
    spec.image = spec.image.trim().to_string();
    if spec.image.is_empty() {
        return Err(ControlError::Validation("image is required".to_string()));
    }
    if spec.ttl < 0 || spec.startup_timeout < 0 {
        return Err(ControlError::Validation(
            "ttl and startupTimeout must not be negative".to_string(),
        ));
    }
    if spec.ttl > MAX_TTL_SECS {
        return Err(ControlError::Validation(format!(
            "ttl must be at most {} seconds, got {}",
            MAX_TTL_SECS, spec.ttl
        )));
    }

    if let Some(probe) = &spec.readiness_probe {
        if probe.exec.command.is_empty() {
            return Err(ControlError::Validation(
                "readinessProbe.exec.command must not be empty".to_string(),
            ));
        }
        if probe.initial_delay_seconds < 0 || probe.period_seconds < 0 || probe.failure_threshold < 0
        {
            return Err(ControlError::Validation(
                "readinessProbe values must not be negative".to_string(),
            ));
        }
    }

    if let Some(file) = spec.files.iter().find(|f| f.destination.trim().is_empty()) {
        return Err(ControlError::Validation(format!(
            "file entry {} has no destination",
            file.source.as_deref().unwrap_or("<inline>")
        )));
    }

    if let Some(network) = &mut spec.network {
        network.allowed_domains = normalize_allowed_domains(&network.allowed_domains)?;
    }
    Ok(())
}

/// Lower-case, trim and de-duplicate domains. A leading `*.` wildcard is the
/// only pattern allowed; schemes, paths and ports are rejected.
pub fn normalize_allowed_domains(domains: &[String]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(domains.len());

    for raw in domains {
        let value = raw.trim().to_lowercase();
        let value = value.strip_suffix('.').unwrap_or(&value).to_string();
        let invalid =
            || ControlError::Validation(format!("allowedDomains contains invalid value: {}", raw));

        if value.is_empty() {
            return Err(ControlError::Validation(
                "allowedDomains contains empty value".to_string(),
            ));
        }
        if value.contains('/') || value.contains(':') {
            return Err(invalid());
        }
        let base = value.strip_prefix("*.").unwrap_or(&value);
        if base.contains('*') || !is_valid_domain(base) {
            return Err(invalid());
        }

        if seen.insert(value.clone()) {
            normalized.push(value);
        }
    }
    Ok(normalized)
}

fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty() && domain.len() <= 253 && domain.split('.').all(is_valid_label)
}

fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
