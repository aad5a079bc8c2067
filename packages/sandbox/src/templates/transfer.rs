// ABOUTME: YAML import and export of templates as SandboxTemplate / SandboxTemplateList documents
// ABOUTME: Imports apply a create/update strategy per template and never abort on one bad entry

use super::{CreateTemplateRequest, TemplateService, UpdateTemplateRequest};
use crate::error::{ControlError, Result};
use chrono::{DateTime, Utc};
use liteboxd_storage::{Template, TemplateSpec, TemplateVersion};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

pub const API_VERSION: &str = "liteboxd/v1";
pub const TEMPLATE_KIND: &str = "SandboxTemplate";
pub const TEMPLATE_LIST_KIND: &str = "SandboxTemplateList";

const IMPORT_CHANGELOG: &str = "Imported from YAML";
const EXPORT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDocument {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: TemplateMetadata,
    pub spec: TemplateSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateListDocument {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items: Vec<TemplateDocument>,
}

/// Just enough of a document to tell which shape it has
#[derive(Deserialize)]
struct DocumentKind {
    #[serde(default)]
    kind: String,
}

impl TemplateDocument {
    fn from_template(template: &Template, spec: TemplateSpec) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: TEMPLATE_KIND.to_string(),
            metadata: TemplateMetadata {
                name: template.name.clone(),
                display_name: template.display_name.clone(),
                description: template.description.clone(),
                tags: template.tags.clone(),
            },
            spec,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportStrategy {
    /// Existing templates are left alone
    CreateOnly,
    /// Only templates that already exist are touched
    UpdateOnly,
    #[default]
    CreateOrUpdate,
}

impl ImportStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateOnly => "create-only",
            Self::UpdateOnly => "update-only",
            Self::CreateOrUpdate => "create-or-update",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "create-only" => Ok(Self::CreateOnly),
            "update-only" => Ok(Self::UpdateOnly),
            "create-or-update" => Ok(Self::CreateOrUpdate),
            _ => Err(ControlError::Validation(format!(
                "invalid import strategy '{}': expected create-only, update-only or create-or-update",
                s
            ))),
        }
    }
}

impl fmt::Display for ImportStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportAction {
    Created,
    Updated,
    Skipped,
    Failed,
}

impl ImportAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportResult {
    pub name: String,
    pub action: ImportAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImportResult {
    fn done(name: &str, action: ImportAction, version: Option<i64>) -> Self {
        Self {
            name: name.to_string(),
            action,
            version,
            error: None,
        }
    }

    fn failed(name: &str, error: impl fmt::Display) -> Self {
        Self {
            name: name.to_string(),
            action: ImportAction::Failed,
            version: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImportReport {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub results: Vec<ImportResult>,
    /// Images with an active prepull after the import
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prepull_images: Vec<String>,
}

impl ImportReport {
    fn record(&mut self, result: ImportResult) {
        match result.action {
            ImportAction::Created => self.created += 1,
            ImportAction::Updated => self.updated += 1,
            ImportAction::Skipped => self.skipped += 1,
            ImportAction::Failed => self.failed += 1,
        }
        self.results.push(result);
    }
}

/// Which templates a bulk export includes; empty fields match everything
#[derive(Debug, Clone, Default)]
pub struct ExportFilter {
    pub tag: Option<String>,
    pub names: Vec<String>,
}

/// Read a single template or a template list.
pub fn parse_documents(raw: &str) -> Result<Vec<TemplateDocument>> {
    let kind: DocumentKind = serde_yaml::from_str(raw)
        .map_err(|e| ControlError::Validation(format!("invalid YAML: {}", e)))?;

    match kind.kind.as_str() {
        TEMPLATE_LIST_KIND => {
            let list: TemplateListDocument = serde_yaml::from_str(raw)
                .map_err(|e| ControlError::Validation(format!("invalid template list: {}", e)))?;
            Ok(list.items)
        }
        TEMPLATE_KIND => {
            let document: TemplateDocument = serde_yaml::from_str(raw)
                .map_err(|e| ControlError::Validation(format!("invalid template: {}", e)))?;
            Ok(vec![document])
        }
        other => Err(ControlError::Validation(format!(
            "invalid kind '{}': expected {} or {}",
            other, TEMPLATE_KIND, TEMPLATE_LIST_KIND
        ))),
    }
}

fn to_yaml<T: Serialize>(value: &T) -> Result<String> {
    serde_yaml::to_string(value)
        .map_err(|e| ControlError::Internal(format!("failed to encode YAML: {}", e)))
}

impl TemplateService {
    // ========================================================================
    // IMPORT
    // ========================================================================

    /// Apply every template in `raw` under `strategy`.
    ///
    /// Only an unreadable document fails the call; each template's own
    /// failure is reported on its result and the rest still run.
    pub async fn import_yaml(
        &self,
        raw: &str,
        strategy: ImportStrategy,
        prepull: bool,
    ) -> Result<ImportReport> {
        let documents = parse_documents(raw)?;
        let mut report = ImportReport {
            total: documents.len(),
            ..Default::default()
        };

        for document in documents {
            let name = document.metadata.name.clone();
            let (result, version) = self.import_one(document, strategy).await;

            if prepull {
                if let Some(version) = &version {
                    if self.auto_prepull(&name, version).await
                        && !report.prepull_images.contains(&version.spec.image)
                    {
                        report.prepull_images.push(version.spec.image.clone());
                    }
                }
            }
            report.record(result);
        }

        info!(
            "Imported {} templates ({}): {} created, {} updated, {} skipped, {} failed",
            report.total, strategy, report.created, report.updated, report.skipped, report.failed
        );
        Ok(report)
    }

    async fn import_one(
        &self,
        document: TemplateDocument,
        strategy: ImportStrategy,
    ) -> (ImportResult, Option<TemplateVersion>) {
        let TemplateDocument { metadata, spec, .. } = document;
        let name = metadata.name;
        if name.trim().is_empty() {
            return (ImportResult::failed(&name, "template name is required"), None);
        }

        let exists = match self.store.get_template(&name).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return (ImportResult::failed(&name, e), None),
        };

        match (strategy, exists) {
            (ImportStrategy::CreateOnly, true) | (ImportStrategy::UpdateOnly, false) => {
                (ImportResult::done(&name, ImportAction::Skipped, None), None)
            }
            (_, false) => {
                let request = CreateTemplateRequest {
                    name: name.clone(),
                    display_name: Some(metadata.display_name),
                    description: metadata.description,
                    tags: metadata.tags,
                    author: String::new(),
                    spec,
                    changelog: None,
                    prepull: false,
                };
                match self.create(request).await {
                    Ok((_, version)) => (
                        ImportResult::done(&name, ImportAction::Created, Some(version.version)),
                        Some(version),
                    ),
                    Err(e) => {
                        warn!("Import of template {} failed: {}", name, e);
                        (ImportResult::failed(&name, e), None)
                    }
                }
            }
            (_, true) => {
                let request = UpdateTemplateRequest {
                    display_name: Some(metadata.display_name).filter(|d| !d.trim().is_empty()),
                    description: Some(metadata.description),
                    tags: Some(metadata.tags),
                    spec: Some(spec),
                    changelog: Some(IMPORT_CHANGELOG.to_string()),
                    prepull: false,
                };
                match self.update(&name, request).await {
                    Ok((template, version)) => (
                        ImportResult::done(
                            &name,
                            ImportAction::Updated,
                            Some(template.latest_version),
                        ),
                        version,
                    ),
                    Err(e) => {
                        warn!("Import of template {} failed: {}", name, e);
                        (ImportResult::failed(&name, e), None)
                    }
                }
            }
        }
    }

    // ========================================================================
    // EXPORT
    // ========================================================================

    /// One template as a `SandboxTemplate` document; latest version unless given.
    pub async fn export_yaml(&self, name: &str, version: Option<i64>) -> Result<String> {
        let template = self.store.get_template(name).await?;
        let version = self
            .store
            .get_version(name, version.unwrap_or(template.latest_version))
            .await?;
        to_yaml(&TemplateDocument::from_template(&template, version.spec))
    }

    /// Matching templates at their latest versions as a `SandboxTemplateList`.
    pub async fn export_all_yaml(&self, filter: &ExportFilter) -> Result<String> {
        let mut templates = Vec::new();
        let mut page = 1;
        loop {
            let (batch, total) = self
                .store
                .list_templates(filter.tag.as_deref(), page, EXPORT_PAGE_SIZE)
                .await?;
            let fetched = batch.len();
            templates.extend(batch);
            if fetched == 0 || templates.len() as i64 >= total {
                break;
            }
            page += 1;
        }

        let mut items = Vec::new();
        for template in templates
            .iter()
            .filter(|t| filter.names.is_empty() || filter.names.contains(&t.name))
        {
            let version = self
                .store
                .get_version(&template.name, template.latest_version)
                .await?;
            items.push(TemplateDocument::from_template(template, version.spec));
        }

        to_yaml(&TemplateListDocument {
            api_version: API_VERSION.to_string(),
            kind: TEMPLATE_LIST_KIND.to_string(),
            exported_at: Some(Utc::now()),
            items,
        })
    }
}
