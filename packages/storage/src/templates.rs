// ABOUTME: Template blueprints and their append-only version history
// ABOUTME: New versions are numbered latest+1 inside the same transaction that bumps latest_version

use crate::{parse_ts, ts, Result, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    pub image: String,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default)]
    pub ttl: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_script: Option<String>,
    #[serde(default)]
    pub startup_timeout: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<ReadinessProbe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub memory: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessProbe {
    pub exec: ProbeExec,
    #[serde(default)]
    pub initial_delay_seconds: i64,
    #[serde(default)]
    pub period_seconds: i64,
    #[serde(default)]
    pub failure_threshold: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProbeExec {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default)]
    pub allow_internet_access: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub author: String,
    pub latest_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateVersion {
    pub id: String,
    pub template_id: String,
    pub version: i64,
    pub spec: TemplateSpec,
    pub changelog: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTemplate {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub author: String,
}

#[derive(Debug, Clone, Default)]
pub struct TemplatePatch {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
}

pub struct TemplateStore {
    pool: SqlitePool,
}

impl TemplateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a template with version 1.
    pub async fn create_template(
        &self,
        new: NewTemplate,
        spec: &TemplateSpec,
        changelog: &str,
    ) -> Result<(Template, TemplateVersion)> {
        let template_id = crate::short_id("tpl");
        let now = ts(&Utc::now());
        let tags_json = serde_json::to_string(&new.tags)?;
        let spec_json = serde_json::to_string(spec)?;

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO templates (
                id, name, display_name, description, tags_json, author,
                latest_version, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)
            "#,
        )
        .bind(&template_id)
        .bind(&new.name)
        .bind(&new.display_name)
        .bind(&new.description)
        .bind(&tags_json)
        .bind(&new.author)
        .bind(&now)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if StorageError::is_unique_violation(&e) {
                return Err(StorageError::Conflict(format!(
                    "template '{}' already exists",
                    new.name
                )));
            }
            return Err(e.into());
        }

        sqlx::query(
            r#"
            INSERT INTO template_versions (id, template_id, version, spec_json, changelog, created_at)
            VALUES (?1, ?2, 1, ?3, ?4, ?5)
            "#,
        )
        .bind(crate::short_id("ver"))
        .bind(&template_id)
        .bind(&spec_json)
        .bind(changelog)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Created template {} ({})", new.name, template_id);

        let template = self.get_template(&new.name).await?;
        let version = self.get_version(&new.name, 1).await?;
        Ok((template, version))
    }

    /// Append version `latest + 1` with the given spec.
    pub async fn append_version(
        &self,
        name: &str,
        spec: &TemplateSpec,
        changelog: &str,
    ) -> Result<(Template, TemplateVersion)> {
        let now = ts(&Utc::now());
        let spec_json = serde_json::to_string(spec)?;

        let mut tx = self.pool.begin().await?;

        let bumped = sqlx::query(
            r#"
            UPDATE templates
            SET latest_version = latest_version + 1, updated_at = ?1
            WHERE name = ?2
            RETURNING id, latest_version
            "#,
        )
        .bind(&now)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = bumped else {
            return Err(StorageError::not_found("template", name));
        };
        let template_id: String = row.get("id");
        let version: i64 = row.get("latest_version");

        sqlx::query(
            r#"
            INSERT INTO template_versions (id, template_id, version, spec_json, changelog, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(crate::short_id("ver"))
        .bind(&template_id)
        .bind(version)
        .bind(&spec_json)
        .bind(changelog)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Template {} now at version {}", name, version);

        let template = self.get_template(name).await?;
        let version = self.get_version(name, version).await?;
        Ok((template, version))
    }

    pub async fn update_metadata(&self, name: &str, patch: &TemplatePatch) -> Result<Template> {
        let current = self.get_template(name).await?;
        let tags_json = serde_json::to_string(patch.tags.as_ref().unwrap_or(&current.tags))?;

        let result = sqlx::query(
            r#"
            UPDATE templates
            SET display_name = ?1, description = ?2, tags_json = ?3, updated_at = ?4
            WHERE name = ?5
            "#,
        )
        .bind(patch.display_name.as_ref().unwrap_or(&current.display_name))
        .bind(patch.description.as_ref().unwrap_or(&current.description))
        .bind(&tags_json)
        .bind(ts(&Utc::now()))
        .bind(name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("template", name));
        }
        self.get_template(name).await
    }

    pub async fn get_template(&self, name: &str) -> Result<Template> {
        let row = sqlx::query(
            r#"
            SELECT id, name, display_name, description, tags_json, author,
                   latest_version, created_at, updated_at
            FROM templates
            WHERE name = ?1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => self.row_to_template(row),
            None => Err(StorageError::not_found("template", name)),
        }
    }

    /// Templates ordered by name, optionally only those carrying `tag`.
    pub async fn list_templates(
        &self,
        tag: Option<&str>,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Template>, i64)> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 100);
        let tag_pattern = tag.map(|t| format!("%{}%", serde_json::to_string(t).unwrap_or_default()));

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM templates WHERE (?1 IS NULL OR tags_json LIKE ?1)",
        )
        .bind(&tag_pattern)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT id, name, display_name, description, tags_json, author,
                   latest_version, created_at, updated_at
            FROM templates
            WHERE (?1 IS NULL OR tags_json LIKE ?1)
            ORDER BY name ASC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(&tag_pattern)
        .bind(page_size as i64)
        .bind(((page - 1) * page_size) as i64)
        .fetch_all(&self.pool)
        .await?;

        let templates = rows
            .into_iter()
            .map(|row| self.row_to_template(row))
            .collect::<Result<Vec<_>>>()?;
        Ok((templates, total))
    }

    pub async fn delete_template(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM template_versions WHERE template_id = (SELECT id FROM templates WHERE name = ?1)",
        )
        .bind(name)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM templates WHERE name = ?1")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StorageError::not_found("template", name));
        }

        tx.commit().await?;
        Ok(())
    }

    // ========================================================================
    // VERSIONS
    // ========================================================================

    pub async fn get_version(&self, name: &str, version: i64) -> Result<TemplateVersion> {
        let row = sqlx::query(
            r#"
            SELECT v.id, v.template_id, v.version, v.spec_json, v.changelog, v.created_at
            FROM template_versions v
            JOIN templates t ON t.id = v.template_id
            WHERE t.name = ?1 AND v.version = ?2
            "#,
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => self.row_to_version(row),
            None => Err(StorageError::not_found(
                "template version",
                format!("{}@{}", name, version),
            )),
        }
    }

    /// Newest version first.
    pub async fn list_versions(&self, name: &str) -> Result<Vec<TemplateVersion>> {
        self.get_template(name).await?;

        let rows = sqlx::query(
            r#"
            SELECT v.id, v.template_id, v.version, v.spec_json, v.changelog, v.created_at
            FROM template_versions v
            JOIN templates t ON t.id = v.template_id
            WHERE t.name = ?1
            ORDER BY v.version DESC
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_version(row)).collect()
    }

    fn row_to_template(&self, row: SqliteRow) -> Result<Template> {
        Ok(Template {
            id: row.get("id"),
            name: row.get("name"),
            display_name: row.get("display_name"),
            description: row.get("description"),
            tags: serde_json::from_str(&row.get::<String, _>("tags_json"))?,
            author: row.get("author"),
            latest_version: row.get("latest_version"),
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
            updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
        })
    }

    fn row_to_version(&self, row: SqliteRow) -> Result<TemplateVersion> {
        Ok(TemplateVersion {
            id: row.get("id"),
            template_id: row.get("template_id"),
            version: row.get("version"),
            spec: serde_json::from_str(&row.get::<String, _>("spec_json"))?,
            changelog: row.get("changelog"),
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        })
    }
}
