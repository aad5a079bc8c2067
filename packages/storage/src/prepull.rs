// ABOUTME: Image prepull task records and per-node readiness reports
// ABOUTME: ready_nodes only ever grows and the task completes when every node reported

use crate::{parse_opt_ts, parse_ts, ts, Result, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

const PREPULL_COLUMNS: &str = r#"
    id, image, image_hash, template_name, status, desired_nodes, ready_nodes,
    error, created_at, started_at, completed_at
"#;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrepullStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl PrepullStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrepullTask {
    pub id: String,
    pub image: String,
    pub image_hash: String,
    pub template: Option<String>,
    pub status: PrepullStatus,
    pub desired_nodes: i64,
    pub ready_nodes: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewPrepull {
    pub image: String,
    pub image_hash: String,
    pub template: Option<String>,
    pub desired_nodes: i64,
}

#[derive(Debug, Clone, Default)]
pub struct PrepullFilter {
    pub image: Option<String>,
    pub status: Option<PrepullStatus>,
}

pub struct PrepullStore {
    pool: SqlitePool,
}

impl PrepullStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a pending task unless one for the same image is still active.
    pub async fn insert_prepull(&self, new: NewPrepull) -> Result<PrepullTask> {
        let id = crate::short_id("pp");

        let result = sqlx::query(
            r#"
            INSERT INTO image_prepulls (
                id, image, image_hash, template_name, status, desired_nodes, ready_nodes, created_at
            )
            SELECT ?1, ?2, ?3, ?4, 'pending', ?5, 0, ?6
            WHERE NOT EXISTS (
                SELECT 1 FROM image_prepulls
                WHERE image = ?2 AND status IN ('pending', 'running')
            )
            "#,
        )
        .bind(&id)
        .bind(&new.image)
        .bind(&new.image_hash)
        .bind(&new.template)
        .bind(new.desired_nodes)
        .bind(ts(&Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "image {} already has an active prepull",
                new.image
            )));
        }

        self.get_prepull(&id).await
    }

    pub async fn get_prepull(&self, id: &str) -> Result<PrepullTask> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM image_prepulls WHERE id = ?1",
            PREPULL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => self.row_to_task(row),
            None => Err(StorageError::not_found("prepull", id)),
        }
    }

    pub async fn list_prepulls(&self, filter: &PrepullFilter) -> Result<Vec<PrepullTask>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM image_prepulls
            WHERE (?1 IS NULL OR image = ?1) AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at DESC, id DESC
            "#,
            PREPULL_COLUMNS
        ))
        .bind(&filter.image)
        .bind(filter.status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.row_to_task(row)).collect()
    }

    /// pending -> running. Returns false when the task was no longer pending.
    pub async fn mark_running(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE image_prepulls SET status = 'running', started_at = ?1
            WHERE id = ?2 AND status = 'pending'
            "#,
        )
        .bind(ts(&at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Fail an active task. Finished tasks are left alone.
    pub async fn mark_failed(&self, id: &str, error: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE image_prepulls SET status = 'failed', error = ?1, completed_at = ?2
            WHERE id = ?3 AND status IN ('pending', 'running')
            "#,
        )
        .bind(error)
        .bind(ts(&at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count a node as ready. Repeat reports from the same node and reports
    /// for finished tasks do not change anything.
    pub async fn record_node_ready(
        &self,
        id: &str,
        node: &str,
        at: DateTime<Utc>,
    ) -> Result<PrepullTask> {
        let at = ts(&at);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO image_prepull_nodes (prepull_id, node, reported_at)
            SELECT ?1, ?2, ?3
            WHERE EXISTS (
                SELECT 1 FROM image_prepulls WHERE id = ?1 AND status IN ('pending', 'running')
            )
            "#,
        )
        .bind(id)
        .bind(node)
        .bind(&at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted > 0 {
            // SET expressions all see the pre-update row
            sqlx::query(
                r#"
                UPDATE image_prepulls
                SET ready_nodes = MIN(ready_nodes + 1, desired_nodes),
                    started_at = COALESCE(started_at, ?1),
                    status = CASE WHEN ready_nodes + 1 >= desired_nodes THEN 'completed' ELSE 'running' END,
                    completed_at = CASE WHEN ready_nodes + 1 >= desired_nodes THEN ?1 ELSE completed_at END
                WHERE id = ?2
                "#,
            )
            .bind(&at)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        if inserted > 0 {
            debug!("Prepull {} node {} ready", id, node);
        }

        self.get_prepull(id).await
    }

    /// Fail every running task started at or before `cutoff`; returns their ids.
    pub async fn fail_started_before(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            UPDATE image_prepulls SET status = 'failed', error = ?1, completed_at = ?2
            WHERE status = 'running' AND started_at IS NOT NULL AND started_at <= ?3
            RETURNING id
            "#,
        )
        .bind(error)
        .bind(ts(&at))
        .bind(ts(&cutoff))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }

    pub async fn delete_prepull(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM image_prepull_nodes WHERE prepull_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM image_prepulls WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StorageError::not_found("prepull", id));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Remove finished tasks that completed before `before`.
    pub async fn delete_finished_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM image_prepull_nodes WHERE prepull_id IN (
                SELECT id FROM image_prepulls
                WHERE status IN ('completed', 'failed') AND completed_at < ?1
            )
            "#,
        )
        .bind(ts(&before))
        .execute(&mut *tx)
        .await?;

        let removed = sqlx::query(
            "DELETE FROM image_prepulls WHERE status IN ('completed', 'failed') AND completed_at < ?1",
        )
        .bind(ts(&before))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(removed)
    }

    pub async fn has_completed(&self, image: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM image_prepulls WHERE image = ?1 AND status = 'completed'",
        )
        .bind(image)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    fn row_to_task(&self, row: SqliteRow) -> Result<PrepullTask> {
        Ok(PrepullTask {
            id: row.get("id"),
            image: row.get("image"),
            image_hash: row.get("image_hash"),
            template: row.get("template_name"),
            status: PrepullStatus::from_str(&row.get::<String, _>("status"))?,
            desired_nodes: row.get("desired_nodes"),
            ready_nodes: row.get("ready_nodes"),
            error: row.get("error"),
            created_at: parse_ts(&row.get::<String, _>("created_at"))?,
            started_at: parse_opt_ts(row.get("started_at"))?,
            completed_at: parse_opt_ts(row.get("completed_at"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;
    use chrono::Duration;

    fn new_prepull(image: &str, nodes: i64) -> NewPrepull {
        NewPrepull {
            image: image.to_string(),
            image_hash: "0123456789ab".to_string(),
            template: None,
            desired_nodes: nodes,
        }
    }

    #[tokio::test]
    async fn test_active_prepull_per_image_is_unique() {
        let store = PrepullStore::new(test_pool().await);
        let task = store.insert_prepull(new_prepull("nginx:1", 2)).await.unwrap();
        assert!(task.id.starts_with("pp-"));
        assert_eq!(task.status, PrepullStatus::Pending);

        let err = store.insert_prepull(new_prepull("nginx:1", 1)).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        store.mark_failed(&task.id, "boom", Utc::now()).await.unwrap();
        assert!(store.insert_prepull(new_prepull("nginx:1", 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_node_reports_are_counted_once() {
        let store = PrepullStore::new(test_pool().await);
        let task = store.insert_prepull(new_prepull("nginx:1", 2)).await.unwrap();
        assert!(store.mark_running(&task.id, Utc::now()).await.unwrap());

        let t = store.record_node_ready(&task.id, "node-a", Utc::now()).await.unwrap();
        assert_eq!(t.ready_nodes, 1);
        assert_eq!(t.status, PrepullStatus::Running);

        let t = store.record_node_ready(&task.id, "node-a", Utc::now()).await.unwrap();
        assert_eq!(t.ready_nodes, 1);

        let t = store.record_node_ready(&task.id, "node-b", Utc::now()).await.unwrap();
        assert_eq!(t.ready_nodes, 2);
        assert_eq!(t.status, PrepullStatus::Completed);
        assert!(t.completed_at.is_some());

        let t = store.record_node_ready(&task.id, "node-c", Utc::now()).await.unwrap();
        assert_eq!(t.ready_nodes, 2);
        assert!(store.has_completed("nginx:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_started_before_only_hits_running() {
        let store = PrepullStore::new(test_pool().await);
        let old = store.insert_prepull(new_prepull("a", 1)).await.unwrap();
        let fresh = store.insert_prepull(new_prepull("b", 1)).await.unwrap();
        let pending = store.insert_prepull(new_prepull("c", 1)).await.unwrap();

        let now = Utc::now();
        store.mark_running(&old.id, now - Duration::seconds(700)).await.unwrap();
        store.mark_running(&fresh.id, now).await.unwrap();

        let failed = store
            .fail_started_before(now - Duration::seconds(600), "timed out", now)
            .await
            .unwrap();
        assert_eq!(failed, vec![old.id.clone()]);

        let old = store.get_prepull(&old.id).await.unwrap();
        assert_eq!(old.status, PrepullStatus::Failed);
        assert_eq!(old.error.as_deref(), Some("timed out"));
        assert_eq!(
            store.get_prepull(&fresh.id).await.unwrap().status,
            PrepullStatus::Running
        );
        assert_eq!(
            store.get_prepull(&pending.id).await.unwrap().status,
            PrepullStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_delete_and_cleanup() {
        let store = PrepullStore::new(test_pool().await);
        let task = store.insert_prepull(new_prepull("a", 1)).await.unwrap();
        store.record_node_ready(&task.id, "n1", Utc::now()).await.unwrap();

        let removed = store
            .delete_finished_before(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_prepull(&task.id).await.unwrap_err().is_not_found());

        let task = store.insert_prepull(new_prepull("b", 1)).await.unwrap();
        store.delete_prepull(&task.id).await.unwrap();
        assert!(store.delete_prepull(&task.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = PrepullStore::new(test_pool().await);
        let a = store.insert_prepull(new_prepull("a", 1)).await.unwrap();
        store.insert_prepull(new_prepull("b", 1)).await.unwrap();
        store.mark_running(&a.id, Utc::now()).await.unwrap();

        let running = store
            .list_prepulls(&PrepullFilter {
                status: Some(PrepullStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].image, "a");

        let all = store.list_prepulls(&PrepullFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
