// ABOUTME: Reconcile run and item audit records
// ABOUTME: Runs are created at pass start and sealed once; items are append-only

use crate::{parse_opt_ts, parse_ts, ts, Result, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::fmt;
use tracing::info;

pub const DEFAULT_RUN_LIMIT: u32 = 20;
pub const MAX_RUN_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Scheduled,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DriftType {
    Expired,
    OrphanInSubstrate,
    MissingInSubstrate,
    StaleStatus,
}

impl DriftType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::OrphanInSubstrate => "orphan-in-substrate",
            Self::MissingInSubstrate => "missing-in-substrate",
            Self::StaleStatus => "stale-status",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "expired" => Ok(Self::Expired),
            "orphan-in-substrate" => Ok(Self::OrphanInSubstrate),
            "missing-in-substrate" => Ok(Self::MissingInSubstrate),
            "stale-status" => Ok(Self::StaleStatus),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

impl fmt::Display for DriftType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FixAction {
    Terminate,
    Recreate,
    UpdateStatus,
    MarkDeleted,
}

impl FixAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminate => "terminate",
            Self::Recreate => "recreate",
            Self::UpdateStatus => "update-status",
            Self::MarkDeleted => "mark-deleted",
        }
    }
}

impl fmt::Display for FixAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FixOutcome {
    Fixed,
    Failed,
    Skipped,
}

impl FixOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileRun {
    pub id: String,
    pub trigger_type: TriggerType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_db: i64,
    pub total_substrate: i64,
    pub drift_count: i64,
    pub fixed_count: i64,
    pub status: RunStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileItem {
    pub id: i64,
    pub run_id: String,
    pub sandbox_id: String,
    pub drift_type: DriftType,
    pub action: String,
    pub outcome: FixOutcome,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewReconcileItem {
    pub run_id: String,
    pub sandbox_id: String,
    pub drift_type: DriftType,
    pub action: FixAction,
    pub outcome: FixOutcome,
    pub detail: String,
}

/// Final figures for a run. Drift and fix counts are derived from the
/// run's items when sealing.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub status: RunStatus,
    pub total_db: i64,
    pub total_substrate: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileRunDetail {
    #[serde(flatten)]
    pub run: ReconcileRun,
    pub items: Vec<ReconcileItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurgeReport {
    pub reconcile_items: u64,
    pub reconcile_runs: u64,
    pub status_history: u64,
    pub sandboxes: u64,
}

pub struct ReconcileStore {
    pool: SqlitePool,
}

impl ReconcileStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // RUN OPERATIONS
    // ========================================================================

    pub async fn create_reconcile_run(&self, trigger: TriggerType) -> Result<ReconcileRun> {
        let id = crate::short_id("rec");
        let started_at = ts(&Utc::now());

        sqlx::query(
            r#"
            INSERT INTO reconcile_runs (id, trigger_type, started_at, status)
            VALUES (?1, ?2, ?3, 'running')
            "#,
        )
        .bind(&id)
        .bind(trigger.as_str())
        .bind(&started_at)
        .execute(&self.pool)
        .await?;

        self.get_reconcile_run(&id).await
    }

    /// Seal a running run. A run can only be sealed once.
    pub async fn seal_reconcile_run(&self, id: &str, summary: RunSummary) -> Result<ReconcileRun> {
        if summary.status == RunStatus::Running {
            return Err(StorageError::InvalidStatus(
                "a run cannot be sealed as running".to_string(),
            ));
        }

        let result = sqlx::query(
            r#"
            UPDATE reconcile_runs
            SET status = ?1,
                finished_at = ?2,
                total_db = ?3,
                total_substrate = ?4,
                error = ?5,
                drift_count = (SELECT COUNT(*) FROM reconcile_items WHERE run_id = ?6),
                fixed_count = (
                    SELECT COUNT(*) FROM reconcile_items WHERE run_id = ?6 AND outcome = 'fixed'
                )
            WHERE id = ?6 AND status = 'running'
            "#,
        )
        .bind(summary.status.as_str())
        .bind(ts(&Utc::now()))
        .bind(summary.total_db)
        .bind(summary.total_substrate)
        .bind(&summary.error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.get_reconcile_run(id).await?;
            return Err(StorageError::Conflict(format!(
                "reconcile run {} is already sealed",
                id
            )));
        }

        let run = self.get_reconcile_run(id).await?;
        info!(
            "Sealed reconcile run {} as {} (drift={}, fixed={})",
            run.id,
            run.status.as_str(),
            run.drift_count,
            run.fixed_count
        );
        Ok(run)
    }

    pub async fn get_reconcile_run(&self, id: &str) -> Result<ReconcileRun> {
        let row = sqlx::query(
            r#"
            SELECT id, trigger_type, started_at, finished_at, total_db, total_substrate,
                   drift_count, fixed_count, status, error
            FROM reconcile_runs
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => self.row_to_run(row),
            None => Err(StorageError::not_found("reconcile run", id)),
        }
    }

    pub async fn list_reconcile_runs(&self, limit: Option<u32>) -> Result<Vec<ReconcileRun>> {
        let limit = match limit {
            None | Some(0) => DEFAULT_RUN_LIMIT,
            Some(n) => n.min(MAX_RUN_LIMIT),
        };

        let rows = sqlx::query(
            r#"
            SELECT id, trigger_type, started_at, finished_at, total_db, total_substrate,
                   drift_count, fixed_count, status, error
            FROM reconcile_runs
            ORDER BY started_at DESC, id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_run(row)).collect()
    }

    pub async fn get_reconcile_run_detail(&self, id: &str) -> Result<ReconcileRunDetail> {
        let run = self.get_reconcile_run(id).await?;
        let items = self.list_reconcile_items(id).await?;
        Ok(ReconcileRunDetail { run, items })
    }

    // ========================================================================
    // ITEM OPERATIONS
    // ========================================================================

    /// Items may only be attached to a run that has not been sealed yet.
    pub async fn append_reconcile_item(&self, item: NewReconcileItem) -> Result<ReconcileItem> {
        let now = ts(&Utc::now());

        let result = sqlx::query(
            r#"
            INSERT INTO reconcile_items (run_id, sandbox_id, drift_type, action, outcome, detail, created_at)
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7
            WHERE EXISTS (SELECT 1 FROM reconcile_runs WHERE id = ?1 AND status = 'running')
            "#,
        )
        .bind(&item.run_id)
        .bind(&item.sandbox_id)
        .bind(item.drift_type.as_str())
        .bind(item.action.as_str())
        .bind(item.outcome.as_str())
        .bind(&item.detail)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.get_reconcile_run(&item.run_id).await?;
            return Err(StorageError::Conflict(format!(
                "reconcile run {} is sealed",
                item.run_id
            )));
        }

        Ok(ReconcileItem {
            id: result.last_insert_rowid(),
            run_id: item.run_id,
            sandbox_id: item.sandbox_id,
            drift_type: item.drift_type,
            action: item.action.as_str().to_string(),
            outcome: item.outcome,
            detail: item.detail,
            created_at: parse_ts(&now)?,
        })
    }

    pub async fn list_reconcile_items(&self, run_id: &str) -> Result<Vec<ReconcileItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, sandbox_id, drift_type, action, outcome, detail, created_at
            FROM reconcile_items
            WHERE run_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_item(row)).collect()
    }

    // ========================================================================
    // RETENTION
    // ========================================================================

    /// Drop audit data older than `cutoff`. Runs still in progress and
    /// sandboxes that are not yet reclaimed are never touched.
    pub async fn purge_history_before(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport> {
        let cutoff = ts(&cutoff);
        let mut tx = self.pool.begin().await?;

        let reconcile_items = sqlx::query(
            r#"
            DELETE FROM reconcile_items
            WHERE run_id IN (
                SELECT id FROM reconcile_runs WHERE finished_at IS NOT NULL AND finished_at < ?1
            )
            "#,
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let reconcile_runs = sqlx::query(
            "DELETE FROM reconcile_runs WHERE finished_at IS NOT NULL AND finished_at < ?1",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let status_history =
            sqlx::query("DELETE FROM sandbox_status_history WHERE created_at < ?1")
                .bind(&cutoff)
                .execute(&mut *tx)
                .await?
                .rows_affected();

        let sandboxes = sqlx::query(
            r#"
            DELETE FROM sandboxes
            WHERE lifecycle_status = 'terminated' AND deleted_at IS NOT NULL AND deleted_at < ?1
            "#,
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        let report = PurgeReport {
            reconcile_items,
            reconcile_runs,
            status_history,
            sandboxes,
        };
        info!("Purged audit data before {}: {:?}", cutoff, report);
        Ok(report)
    }

    // ========================================================================
    // HELPER METHODS
    // ========================================================================

    fn row_to_run(&self, row: SqliteRow) -> Result<ReconcileRun> {
        Ok(ReconcileRun {
            id: row.get("id"),
            trigger_type: TriggerType::from_str(&row.get::<String, _>("trigger_type"))?,
            started_at: parse_ts(&row.get::<String, _>("started_at"))?,
            finished_at: parse_opt_ts(row.get("finished_at"))?,
            total_db: row.get("total_db"),
            total_substrate: row.get("total_substrate"),
            drift_count: row.get("drift_count"),
            fixed_count: row.get("fixed_count"),
            status: RunStatus::from_str(&row.get::<String, _>("status"))?,
            error: row.get("error"),
        })
    }

    fn row_to_item(&self, row: SqliteRow) -> Result<ReconcileItem> {
        Ok(ReconcileItem {
            id: row.get("id"),
            run_id: row.get("run_id"),
            sandbox_id: row.get("sandbox_id"),
            drift_type: DriftType::from_str(&row.get::<String, _>("drift_type"))?,
            action: row.get("action"),
            outcome: FixOutcome::from_str(&row.get::<String, _>("outcome"))?,
            detail: row.get("detail"),
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        })
    }
}
