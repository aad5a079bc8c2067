// ABOUTME: Sandbox records and their append-only status history
// ABOUTME: Lifecycle changes are written together with their history row in one transaction

use crate::lifecycle::{self, DesiredState, HistorySource, LifecycleStatus};
use crate::{parse_opt_ts, parse_ts, ts, Result, StorageError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use tracing::debug;

const SANDBOX_COLUMNS: &str = r#"
    id, template_name, template_version, image, cpu, memory, ttl_seconds, env_json,
    desired_state, lifecycle_status, status_reason, pod_phase, pod_ip, last_seen_at,
    revision, created_at, expires_at, updated_at, deleted_at
"#;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 200;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sandbox {
    pub id: String,
    pub template_name: Option<String>,
    pub template_version: Option<i64>,
    pub image: String,
    pub cpu: String,
    pub memory: String,
    pub ttl_seconds: i64,
    pub env: HashMap<String, String>,
    pub desired_state: DesiredState,
    pub lifecycle_status: LifecycleStatus,
    pub status_reason: Option<String>,
    pub pod_phase: Option<String>,
    pub pod_ip: Option<String>,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Bumped on every desired-state or lifecycle change
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Sandbox {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Fully resolved spec for a new sandbox.
#[derive(Debug, Clone, Default)]
pub struct NewSandbox {
    pub id: Option<String>,
    pub template_name: Option<String>,
    pub template_version: Option<i64>,
    pub image: String,
    pub cpu: String,
    pub memory: String,
    pub ttl_seconds: i64,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusHistoryItem {
    pub id: i64,
    pub sandbox_id: String,
    pub source: HistorySource,
    pub from_status: Option<LifecycleStatus>,
    pub to_status: LifecycleStatus,
    pub reason: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewHistoryItem {
    pub sandbox_id: String,
    pub source: HistorySource,
    pub from_status: Option<LifecycleStatus>,
    pub to_status: LifecycleStatus,
    pub reason: String,
    pub payload: JsonValue,
}

#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub to: LifecycleStatus,
    pub reason: String,
    pub source: HistorySource,
    pub payload: JsonValue,
    /// When set, the write only lands if the record is still at this revision
    pub expected_revision: Option<i64>,
}

impl TransitionRequest {
    pub fn new(to: LifecycleStatus, source: HistorySource, reason: impl Into<String>) -> Self {
        Self {
            to,
            reason: reason.into(),
            source,
            payload: JsonValue::Object(Default::default()),
            expected_revision: None,
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    pub fn expecting(mut self, revision: i64) -> Self {
        self.expected_revision = Some(revision);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SandboxFilter {
    pub id_prefix: Option<String>,
    pub template: Option<String>,
    pub desired_state: Option<DesiredState>,
    pub lifecycle_status: Option<LifecycleStatus>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub deleted_from: Option<DateTime<Utc>>,
    pub deleted_to: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPage {
    pub items: Vec<Sandbox>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

/// Longest lifetime a sandbox may be given (ten years)
pub const MAX_TTL_SECS: i64 = 10 * 365 * 24 * 60 * 60;

fn expiry(now: DateTime<Utc>, ttl_seconds: i64) -> Result<DateTime<Utc>> {
    if !(1..=MAX_TTL_SECS).contains(&ttl_seconds) {
        return Err(StorageError::InvalidValue(format!(
            "ttl_seconds must be between 1 and {}, got {}",
            MAX_TTL_SECS, ttl_seconds
        )));
    }
    Duration::try_seconds(ttl_seconds)
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| {
            StorageError::InvalidValue(format!("ttl_seconds {} overflows expiry", ttl_seconds))
        })
}

pub struct SandboxStore {
    pool: SqlitePool,
}

impl SandboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // SANDBOX OPERATIONS
    // ========================================================================

    /// Insert a sandbox in `pending` together with its creation history row.
    pub async fn insert_sandbox(&self, new: NewSandbox) -> Result<Sandbox> {
        let id = new.id.unwrap_or_else(|| crate::short_id("sbx"));
        let now = Utc::now();
        let expires_at = expiry(now, new.ttl_seconds)?;
        let env_json = serde_json::to_string(&new.env)?;

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO sandboxes (
                id, template_name, template_version, image, cpu, memory, ttl_seconds, env_json,
                desired_state, lifecycle_status, revision, created_at, expires_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12, ?11)
            "#,
        )
        .bind(&id)
        .bind(&new.template_name)
        .bind(new.template_version)
        .bind(&new.image)
        .bind(&new.cpu)
        .bind(&new.memory)
        .bind(new.ttl_seconds)
        .bind(&env_json)
        .bind(DesiredState::Running.as_str())
        .bind(LifecycleStatus::Pending.as_str())
        .bind(ts(&now))
        .bind(ts(&expires_at))
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if StorageError::is_unique_violation(&e) {
                return Err(StorageError::Conflict(format!("sandbox {} already exists", id)));
            }
            return Err(e.into());
        }

        insert_history(
            &mut *tx,
            &NewHistoryItem {
                sandbox_id: id.clone(),
                source: HistorySource::Api,
                from_status: None,
                to_status: LifecycleStatus::Pending,
                reason: "sandbox created".to_string(),
                payload: serde_json::json!({ "image": new.image }),
            },
            &now,
        )
        .await?;

        tx.commit().await?;
        debug!("Inserted sandbox {}", id);

        self.get_sandbox(&id).await
    }

    pub async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sandboxes WHERE id = ?1",
            SANDBOX_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => self.row_to_sandbox(row),
            None => Err(StorageError::not_found("sandbox", id)),
        }
    }

    pub async fn list_sandboxes(&self, filter: &SandboxFilter) -> Result<SandboxPage> {
        let page = filter.page.filter(|p| *p > 0).unwrap_or(1);
        let page_size = match filter.page_size {
            None | Some(0) => DEFAULT_PAGE_SIZE,
            Some(n) => n.min(MAX_PAGE_SIZE),
        };

        let mut where_clause = String::from(" WHERE 1=1");
        let mut params: Vec<String> = Vec::new();

        if let Some(prefix) = &filter.id_prefix {
            params.push(format!("{}%", escape_like(prefix)));
            where_clause.push_str(&format!(" AND id LIKE ?{} ESCAPE '\\'", params.len()));
        }
        if let Some(template) = &filter.template {
            params.push(template.clone());
            where_clause.push_str(&format!(" AND template_name = ?{}", params.len()));
        }
        if let Some(state) = filter.desired_state {
            params.push(state.as_str().to_string());
            where_clause.push_str(&format!(" AND desired_state = ?{}", params.len()));
        }
        if let Some(status) = filter.lifecycle_status {
            params.push(status.as_str().to_string());
            where_clause.push_str(&format!(" AND lifecycle_status = ?{}", params.len()));
        }
        if let Some(from) = &filter.created_from {
            params.push(ts(from));
            where_clause.push_str(&format!(" AND created_at >= ?{}", params.len()));
        }
        if let Some(to) = &filter.created_to {
            params.push(ts(to));
            where_clause.push_str(&format!(" AND created_at <= ?{}", params.len()));
        }
        if let Some(from) = &filter.deleted_from {
            params.push(ts(from));
            where_clause.push_str(&format!(" AND deleted_at >= ?{}", params.len()));
        }
        if let Some(to) = &filter.deleted_to {
            params.push(ts(to));
            where_clause.push_str(&format!(" AND deleted_at <= ?{}", params.len()));
        }

        let count_sql = format!("SELECT COUNT(*) FROM sandboxes{}", where_clause);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for p in &params {
            count_query = count_query.bind(p);
        }
        let total = count_query.fetch_one(&self.pool).await?;

        let list_sql = format!(
            "SELECT {} FROM sandboxes{} ORDER BY created_at DESC, id DESC LIMIT ?{} OFFSET ?{}",
            SANDBOX_COLUMNS,
            where_clause,
            params.len() + 1,
            params.len() + 2
        );
        let mut list_query = sqlx::query(&list_sql);
        for p in &params {
            list_query = list_query.bind(p);
        }
        let rows = list_query
            .bind(page_size as i64)
            .bind(((page - 1) as i64) * page_size as i64)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(|row| self.row_to_sandbox(row))
            .collect::<Result<Vec<_>>>()?;

        Ok(SandboxPage {
            items,
            total,
            page,
            page_size,
        })
    }

    /// Every record the reconciler still has to look at: anything not both
    /// deleted and terminated.
    pub async fn list_reconcilable(&self) -> Result<Vec<Sandbox>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM sandboxes
            WHERE NOT (desired_state = 'deleted' AND lifecycle_status = 'terminated')
            ORDER BY id ASC
            "#,
            SANDBOX_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_sandbox(row)).collect()
    }

    /// Set the operator's intent. Re-setting the current value is a no-op.
    pub async fn upsert_desired_state(
        &self,
        id: &str,
        state: DesiredState,
        expected_revision: Option<i64>,
    ) -> Result<Sandbox> {
        let current = self.get_sandbox(id).await?;
        check_revision(&current, expected_revision)?;

        if current.desired_state == state {
            return Ok(current);
        }

        let now = ts(&Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET desired_state = ?1,
                revision = revision + 1,
                updated_at = ?2,
                deleted_at = CASE
                    WHEN ?1 = 'deleted' AND lifecycle_status = 'terminated'
                    THEN COALESCE(deleted_at, ?2)
                    ELSE deleted_at
                END
            WHERE id = ?3 AND revision = ?4
            "#,
        )
        .bind(state.as_str())
        .bind(&now)
        .bind(id)
        .bind(current.revision)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "sandbox {} changed while updating desired state",
                id
            )));
        }

        debug!("Sandbox {} desired state -> {}", id, state);
        self.get_sandbox(id).await
    }

    /// Move a sandbox to a new lifecycle status and append the history row,
    /// both or neither. Same-state requests return the record untouched.
    pub async fn record_lifecycle_transition(
        &self,
        id: &str,
        request: TransitionRequest,
    ) -> Result<Sandbox> {
        let current = self.get_sandbox(id).await?;
        check_revision(&current, request.expected_revision)?;

        if current.lifecycle_status == request.to {
            return Ok(current);
        }
        lifecycle::validate_transition(current.lifecycle_status, request.to)?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction takes the write lock up front.
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET lifecycle_status = ?1,
                status_reason = ?2,
                revision = revision + 1,
                updated_at = ?3,
                deleted_at = CASE
                    WHEN ?1 = 'terminated' AND desired_state = 'deleted'
                    THEN COALESCE(deleted_at, ?3)
                    ELSE deleted_at
                END
            WHERE id = ?4 AND revision = ?5 AND lifecycle_status = ?6
            "#,
        )
        .bind(request.to.as_str())
        .bind(&request.reason)
        .bind(ts(&now))
        .bind(id)
        .bind(current.revision)
        .bind(current.lifecycle_status.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StorageError::Conflict(format!(
                "sandbox {} changed during lifecycle transition",
                id
            )));
        }

        insert_history(
            &mut *tx,
            &NewHistoryItem {
                sandbox_id: id.to_string(),
                source: request.source,
                from_status: Some(current.lifecycle_status),
                to_status: request.to,
                reason: request.reason.clone(),
                payload: request.payload.clone(),
            },
            &now,
        )
        .await?;

        tx.commit().await?;
        debug!(
            "Sandbox {} lifecycle {} -> {} ({})",
            id,
            current.lifecycle_status,
            request.to,
            request.source.as_str()
        );

        self.get_sandbox(id).await
    }

    /// Record substrate facts. Older observations than the stored one are
    /// dropped; returns whether the write landed.
    pub async fn record_observation(
        &self,
        id: &str,
        phase: &str,
        ip: Option<&str>,
        observed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET pod_phase = ?1, pod_ip = ?2, last_seen_at = ?3
            WHERE id = ?4 AND (last_seen_at IS NULL OR last_seen_at <= ?3)
            "#,
        )
        .bind(phase)
        .bind(ip)
        .bind(ts(&observed_at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // distinguish "older observation" from "no such sandbox"
            self.get_sandbox(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    // ========================================================================
    // STATUS HISTORY
    // ========================================================================

    /// Append a standalone history row. Lifecycle changes should go through
    /// `record_lifecycle_transition`, which writes its row atomically.
    pub async fn append_history(&self, item: NewHistoryItem) -> Result<StatusHistoryItem> {
        self.get_sandbox(&item.sandbox_id).await?;
        let now = Utc::now();
        let id = insert_history(&self.pool, &item, &now).await?;

        Ok(StatusHistoryItem {
            id,
            sandbox_id: item.sandbox_id,
            source: item.source,
            from_status: item.from_status,
            to_status: item.to_status,
            reason: item.reason,
            payload: item.payload,
            created_at: crate::parse_ts(&ts(&now))?,
        })
    }

    /// Newest first. `before_id` is an exclusive cursor.
    pub async fn list_status_history(
        &self,
        sandbox_id: &str,
        before_id: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<StatusHistoryItem>> {
        self.get_sandbox(sandbox_id).await?;

        let limit = match limit {
            None | Some(0) => DEFAULT_HISTORY_LIMIT,
            Some(n) => n.min(MAX_HISTORY_LIMIT),
        };

        let rows = sqlx::query(
            r#"
            SELECT id, sandbox_id, source, from_status, to_status, reason, payload_json, created_at
            FROM sandbox_status_history
            WHERE sandbox_id = ?1 AND (?2 IS NULL OR id < ?2)
            ORDER BY id DESC
            LIMIT ?3
            "#,
        )
        .bind(sandbox_id)
        .bind(before_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_history(row)).collect()
    }

    // ========================================================================
    // HELPER METHODS
    // ========================================================================

    fn row_to_sandbox(&self, row: SqliteRow) -> Result<Sandbox> {
        let env_json: String = row.get("env_json");

        Ok(Sandbox {
            id: row.get("id"),
            template_name: row.get("template_name"),
            template_version: row.get("template_version"),
            image: row.get("image"),
            cpu: row.get("cpu"),
            memory: row.get("memory"),
            ttl_seconds: row.get("ttl_seconds"),
            env: serde_json::from_str(&env_json)?,
            desired_state: DesiredState::from_str(&row.get::<String, _>("desired_state"))?,
            lifecycle_status: LifecycleStatus::from_str(
                &row.get::<String, _>("lifecycle_status"),
            )?,
            status_reason: row.get("status_reason"),
            pod_phase: row.get("pod_phase"),
            pod_ip: row.get("pod_ip"),
            last_seen_at: parse_opt_ts(row.get("last_seen_at"))?,
            revision: row.get("revision"),
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
            expires_at: parse_ts(&row.get::<String, _>("expires_at"))?,
            updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
            deleted_at: parse_opt_ts(row.get("deleted_at"))?,
        })
    }

    fn row_to_history(&self, row: SqliteRow) -> Result<StatusHistoryItem> {
        let from_status = row
            .get::<Option<String>, _>("from_status")
            .map(|s| LifecycleStatus::from_str(&s))
            .transpose()?;

        Ok(StatusHistoryItem {
            id: row.get("id"),
            sandbox_id: row.get("sandbox_id"),
            source: HistorySource::from_str(&row.get::<String, _>("source"))?,
            from_status,
            to_status: LifecycleStatus::from_str(&row.get::<String, _>("to_status"))?,
            reason: row.get("reason"),
            payload: serde_json::from_str(&row.get::<String, _>("payload_json"))?,
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        })
    }
}

fn check_revision(current: &Sandbox, expected: Option<i64>) -> Result<()> {
    match expected {
        Some(rev) if rev != current.revision => Err(StorageError::Conflict(format!(
            "sandbox {} is at revision {}, expected {}",
            current.id, current.revision, rev
        ))),
        _ => Ok(()),
    }
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

async fn insert_history<'e, E>(
    executor: E,
    item: &NewHistoryItem,
    at: &DateTime<Utc>,
) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let payload_json = serde_json::to_string(&item.payload)?;

    let result = sqlx::query(
        r#"
        INSERT INTO sandbox_status_history (
            sandbox_id, source, from_status, to_status, reason, payload_json, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&item.sandbox_id)
    .bind(item.source.as_str())
    .bind(item.from_status.map(|s| s.as_str()))
    .bind(item.to_status.as_str())
    .bind(&item.reason)
    .bind(payload_json)
    .bind(ts(at))
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}
