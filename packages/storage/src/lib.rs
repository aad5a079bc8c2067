// ABOUTME: State store for the sandbox control plane backed by SQLite
// ABOUTME: Owns the schema, connection setup and shared error and timestamp helpers

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

pub mod lifecycle;
pub mod prepull;
pub mod reconcile;
pub mod sandboxes;
pub mod templates;

pub use lifecycle::{DesiredState, HistorySource, LifecycleStatus, TransitionError};
pub use prepull::{NewPrepull, PrepullFilter, PrepullStatus, PrepullStore, PrepullTask};
pub use reconcile::{
    DriftType, FixAction, FixOutcome, NewReconcileItem, PurgeReport, ReconcileItem, ReconcileRun,
    ReconcileRunDetail, ReconcileStore, RunStatus, RunSummary, TriggerType,
};
pub use sandboxes::{
    NewHistoryItem, NewSandbox, Sandbox, MAX_TTL_SECS, SandboxFilter, SandboxPage, SandboxStore,
    StatusHistoryItem, TransitionRequest,
};
pub use templates::{
    FileSpec, NetworkSpec, NewTemplate, ProbeExec, ReadinessProbe, ResourceSpec, Template,
    TemplatePatch, TemplateSpec, TemplateStore, TemplateVersion,
};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    /// A caller-supplied value the store cannot represent
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Open (creating if needed) the database at `url` and bring the schema up to date.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    info!("State store ready at {}", url);

    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Timestamps are stored with fixed precision so string order matches time order.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidData(format!("bad timestamp '{}': {}", raw, e)))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

/// Short random suffix used by the `xxx-<hex>` identifiers.
pub(crate) fn short_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &hex[..8])
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate(&pool).await.unwrap();
    pool
}
