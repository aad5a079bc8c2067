// ABOUTME: Image prepull scheduling: stage an image on a set of nodes and track it to completion
// ABOUTME: Node agents pull in the background and report back over a channel

use crate::error::{ControlError, Result};
use crate::substrate::SubstrateError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use liteboxd_storage::{NewPrepull, PrepullFilter, PrepullStatus, PrepullStore, PrepullTask};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time;
use tracing::{debug, error, info, warn};

pub mod docker;

pub use docker::DockerPrepullAgent;

/// Sent by a node agent when it finishes its part of a task
#[derive(Debug, Clone, PartialEq)]
pub struct NodeReport {
    pub task_id: String,
    pub node: String,
    /// Set when the node could not pull the image
    pub error: Option<String>,
}

impl NodeReport {
    pub fn ready(task_id: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            node: node.into(),
            error: None,
        }
    }

    pub fn failed(task_id: impl Into<String>, node: impl Into<String>, error: String) -> Self {
        Self {
            task_id: task_id.into(),
            node: node.into(),
            error: Some(error),
        }
    }
}

/// The node-side half of a prepull.
#[async_trait]
pub trait PrepullAgent: Send + Sync {
    /// Start pulling on the agent's nodes. Returns once the work is handed off.
    async fn dispatch(&self, task: &PrepullTask) -> std::result::Result<(), SubstrateError>;

    /// Stop outstanding work for a task. Images already pulled stay.
    async fn cancel(&self, task_id: &str) -> std::result::Result<(), SubstrateError>;
}

/// Content identity of an image reference, independent of tag mutation
pub fn image_hash(image: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(image.as_bytes()));
    digest[..12].to_string()
}

pub struct PrepullScheduler {
    store: PrepullStore,
    agent: Arc<dyn PrepullAgent>,
    timeout: Duration,
}

impl PrepullScheduler {
    pub fn new(pool: SqlitePool, agent: Arc<dyn PrepullAgent>, timeout: Duration) -> Self {
        Self {
            store: PrepullStore::new(pool),
            agent,
            timeout,
        }
    }

    /// Create a pending task. Only one active task per image at a time.
    pub async fn schedule(
        &self,
        image: &str,
        target_nodes: i64,
        template: Option<&str>,
    ) -> Result<PrepullTask> {
        let image = image.trim();
        if image.is_empty() {
            return Err(ControlError::Validation("image is required".to_string()));
        }
        if target_nodes < 1 {
            return Err(ControlError::Validation(format!(
                "target node count must be at least 1, got {}",
                target_nodes
            )));
        }

        let task = self
            .store
            .insert_prepull(NewPrepull {
                image: image.to_string(),
                image_hash: image_hash(image),
                template: template.map(str::to_string),
                desired_nodes: target_nodes,
            })
            .await?;

        info!(
            "Scheduled prepull {} of {} on {} node(s)",
            task.id, task.image, task.desired_nodes
        );
        Ok(task)
    }

    /// Hand every pending task to the agent; returns how many were dispatched
    pub async fn dispatch_pending(&self) -> Result<usize> {
        let pending = self
            .store
            .list_prepulls(&PrepullFilter {
                status: Some(PrepullStatus::Pending),
                ..Default::default()
            })
            .await?;

        let mut dispatched = 0;
        for task in pending {
            if !self.store.mark_running(&task.id, Utc::now()).await? {
                continue;
            }
            match self.agent.dispatch(&task).await {
                Ok(()) => {
                    debug!("Dispatched prepull {}", task.id);
                    dispatched += 1;
                }
                Err(e) => {
                    warn!("Dispatch of prepull {} failed: {}", task.id, e);
                    self.store
                        .mark_failed(&task.id, &format!("dispatch failed: {}", e), Utc::now())
                        .await?;
                }
            }
        }
        Ok(dispatched)
    }

    /// Count `node` as ready for `task_id`
    pub async fn report_node_ready(&self, task_id: &str, node: &str) -> Result<PrepullTask> {
        let task = self
            .store
            .record_node_ready(task_id, node, Utc::now())
            .await?;
        if task.status == PrepullStatus::Completed {
            info!("Prepull {} of {} completed", task.id, task.image);
        }
        Ok(task)
    }

    /// A node could not pull; the task fails without retry
    pub async fn report_node_failed(
        &self,
        task_id: &str,
        node: &str,
        error: &str,
    ) -> Result<PrepullTask> {
        let failed = self
            .store
            .mark_failed(task_id, &format!("node {}: {}", node, error), Utc::now())
            .await?;
        if failed {
            warn!("Prepull {} failed on node {}: {}", task_id, node, error);
        }
        Ok(self.store.get_prepull(task_id).await?)
    }

    /// Fail running tasks that exceeded the timeout; returns their ids
    pub async fn fail_timed_out(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let timeout = chrono::Duration::from_std(self.timeout)
            .map_err(|e| ControlError::Internal(format!("prepull timeout out of range: {}", e)))?;
        let failed = self
            .store
            .fail_started_before(
                now - timeout,
                &format!("timed out after {}s", self.timeout.as_secs()),
                now,
            )
            .await?;

        for id in &failed {
            warn!("Prepull {} timed out", id);
            if let Err(e) = self.agent.cancel(id).await {
                warn!("Failed to cancel prepull {} on agent: {}", id, e);
            }
        }
        Ok(failed)
    }

    /// Remove a task, cancelling outstanding node work best-effort
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        let task = self.store.get_prepull(task_id).await?;
        if task.status.is_active() {
            if let Err(e) = self.agent.cancel(task_id).await {
                warn!("Failed to cancel prepull {} on agent: {}", task_id, e);
            }
        }
        self.store.delete_prepull(task_id).await?;
        info!("Deleted prepull {}", task_id);
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Result<PrepullTask> {
        Ok(self.store.get_prepull(task_id).await?)
    }

    pub async fn list(&self, filter: &PrepullFilter) -> Result<Vec<PrepullTask>> {
        Ok(self.store.list_prepulls(filter).await?)
    }

    /// Drop finished tasks that completed before `before`
    pub async fn cleanup_finished(&self, before: DateTime<Utc>) -> Result<u64> {
        Ok(self.store.delete_finished_before(before).await?)
    }

    pub async fn is_image_prepulled(&self, image: &str) -> Result<bool> {
        Ok(self.store.has_completed(image.trim()).await?)
    }
}

/// Background driver: dispatches pending tasks, sweeps timeouts and folds
/// node reports into the store.
pub struct PrepullWorker {
    scheduler: Arc<PrepullScheduler>,
    reports: Mutex<Option<mpsc::Receiver<NodeReport>>>,
    sweep_interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl PrepullWorker {
    pub fn new(
        scheduler: Arc<PrepullScheduler>,
        reports: mpsc::Receiver<NodeReport>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            scheduler,
            reports: Mutex::new(Some(reports)),
            sweep_interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn start(&self) {
        let Some(mut reports) = self.reports.lock().await.take() else {
            return;
        };
        *self.running.write().await = true;

        let scheduler = self.scheduler.clone();
        let running_flag = self.running.clone();
        let mut ticker = time::interval(self.sweep_interval);

        tokio::spawn(async move {
            info!("Prepull worker started");

            loop {
                tokio::select! {
                    Some(report) = reports.recv() => {
                        Self::apply_report(&scheduler, report).await;
                    }
                    _ = ticker.tick() => {
                        if !*running_flag.read().await {
                            info!("Prepull worker stopped");
                            break;
                        }
                        Self::sweep(&scheduler).await;
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    async fn apply_report(scheduler: &PrepullScheduler, report: NodeReport) {
        let result = match &report.error {
            None => scheduler
                .report_node_ready(&report.task_id, &report.node)
                .await,
            Some(err) => {
                scheduler
                    .report_node_failed(&report.task_id, &report.node, err)
                    .await
            }
        };
        if let Err(e) = result {
            // deleted tasks may still get late reports
            debug!("Dropped node report for {}: {}", report.task_id, e);
        }
    }

    async fn sweep(scheduler: &PrepullScheduler) {
        if let Err(e) = scheduler.dispatch_pending().await {
            error!("Prepull dispatch failed: {}", e);
        }
        if let Err(e) = scheduler.fail_timed_out(Utc::now()).await {
            error!("Prepull timeout sweep failed: {}", e);
        }
    }
}

/// Agent that treats every requested node as pulled immediately.
#[derive(Default)]
pub struct InMemoryPrepullAgent {
    reports: Option<mpsc::Sender<NodeReport>>,
    dispatched: RwLock<Vec<String>>,
    cancelled: RwLock<Vec<String>>,
    dispatch_error: RwLock<Option<String>>,
}

impl InMemoryPrepullAgent {
    /// Records calls but never reports
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `node-1..=node-N` ready for each dispatched task
    pub fn reporting_to(reports: mpsc::Sender<NodeReport>) -> Self {
        Self {
            reports: Some(reports),
            ..Default::default()
        }
    }

    pub async fn fail_dispatch(&self, error: Option<&str>) {
        *self.dispatch_error.write().await = error.map(str::to_string);
    }

    pub async fn dispatched(&self) -> Vec<String> {
        self.dispatched.read().await.clone()
    }

    pub async fn cancelled(&self) -> Vec<String> {
        self.cancelled.read().await.clone()
    }
}

#[async_trait]
impl PrepullAgent for InMemoryPrepullAgent {
    async fn dispatch(&self, task: &PrepullTask) -> std::result::Result<(), SubstrateError> {
        if let Some(error) = self.dispatch_error.read().await.clone() {
            return Err(SubstrateError::ImageError(error));
        }
        self.dispatched.write().await.push(task.id.clone());

        if let Some(reports) = self.reports.clone() {
            // reports go through the same worker that dispatches, so never block here
            let task_id = task.id.clone();
            let nodes = task.desired_nodes;
            tokio::spawn(async move {
                for n in 1..=nodes {
                    if reports
                        .send(NodeReport::ready(&task_id, format!("node-{}", n)))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
        Ok(())
    }

    async fn cancel(&self, task_id: &str) -> std::result::Result<(), SubstrateError> {
        self.cancelled.write().await.push(task_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;
    use pretty_assertions::assert_eq;

    async fn scheduler(agent: Arc<InMemoryPrepullAgent>) -> PrepullScheduler {
        PrepullScheduler::new(test_pool().await, agent, Duration::from_secs(600))
    }

    #[test]
    fn test_image_hash_is_stable_and_short() {
        let hash = image_hash("nginx:1.27");
        assert_eq!(hash.len(), 12);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, image_hash("nginx:1.27"));
        assert_ne!(hash, image_hash("nginx:1.26"));
    }

    #[tokio::test]
    async fn test_schedule_validates_and_rejects_duplicates() {
        let scheduler = scheduler(Arc::new(InMemoryPrepullAgent::new())).await;

        assert!(matches!(
            scheduler.schedule(" ", 1, None).await,
            Err(ControlError::Validation(_))
        ));
        assert!(matches!(
            scheduler.schedule("nginx:1.27", 0, None).await,
            Err(ControlError::Validation(_))
        ));

        let task = scheduler.schedule("nginx:1.27", 2, Some("web")).await.unwrap();
        assert_eq!(task.status, PrepullStatus::Pending);
        assert_eq!(task.image_hash, image_hash("nginx:1.27"));
        assert_eq!(task.template.as_deref(), Some("web"));

        let err = scheduler.schedule("nginx:1.27", 3, None).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_node_reports_complete_task() {
        let agent = Arc::new(InMemoryPrepullAgent::new());
        let scheduler = scheduler(agent.clone()).await;
        let task = scheduler.schedule("redis:7", 2, None).await.unwrap();

        assert_eq!(scheduler.dispatch_pending().await.unwrap(), 1);
        assert_eq!(agent.dispatched().await, vec![task.id.clone()]);
        assert_eq!(
            scheduler.get(&task.id).await.unwrap().status,
            PrepullStatus::Running
        );

        let after_one = scheduler.report_node_ready(&task.id, "node-a").await.unwrap();
        assert_eq!(after_one.ready_nodes, 1);
        // the same node counts once
        let again = scheduler.report_node_ready(&task.id, "node-a").await.unwrap();
        assert_eq!(again.ready_nodes, 1);

        let done = scheduler.report_node_ready(&task.id, "node-b").await.unwrap();
        assert_eq!(done.ready_nodes, 2);
        assert_eq!(done.status, PrepullStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(scheduler.is_image_prepulled("redis:7").await.unwrap());

        // completed tasks ignore late reports
        let late = scheduler.report_node_ready(&task.id, "node-c").await.unwrap();
        assert_eq!(late.ready_nodes, 2);
    }

    #[tokio::test]
    async fn test_dispatch_failure_fails_task() {
        let agent = Arc::new(InMemoryPrepullAgent::new());
        agent.fail_dispatch(Some("registry unreachable")).await;
        let scheduler = scheduler(agent).await;
        let task = scheduler.schedule("redis:7", 1, None).await.unwrap();

        assert_eq!(scheduler.dispatch_pending().await.unwrap(), 0);
        let failed = scheduler.get(&task.id).await.unwrap();
        assert_eq!(failed.status, PrepullStatus::Failed);
        assert!(failed.error.unwrap().contains("registry unreachable"));
    }

    #[tokio::test]
    async fn test_running_task_times_out() {
        let agent = Arc::new(InMemoryPrepullAgent::new());
        let scheduler = scheduler(agent.clone()).await;
        let task = scheduler.schedule("postgres:16", 1, None).await.unwrap();
        scheduler.dispatch_pending().await.unwrap();

        let early = scheduler.fail_timed_out(Utc::now()).await.unwrap();
        assert!(early.is_empty());

        let later = Utc::now() + chrono::Duration::seconds(601);
        let failed = scheduler.fail_timed_out(later).await.unwrap();
        assert_eq!(failed, vec![task.id.clone()]);
        assert_eq!(agent.cancelled().await, vec![task.id.clone()]);

        let task = scheduler.get(&task.id).await.unwrap();
        assert_eq!(task.status, PrepullStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("timed out after 600s"));

        // a new attempt is allowed once the old one failed
        assert!(scheduler.schedule("postgres:16", 1, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_cancels_active_task() {
        let agent = Arc::new(InMemoryPrepullAgent::new());
        let scheduler = scheduler(agent.clone()).await;
        let task = scheduler.schedule("node:22", 1, None).await.unwrap();

        scheduler.delete(&task.id).await.unwrap();
        assert_eq!(agent.cancelled().await, vec![task.id.clone()]);
        assert!(scheduler.get(&task.id).await.unwrap_err().is_not_found());
        assert!(scheduler.delete(&task.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_worker_drives_task_to_completion() {
        let (tx, rx) = mpsc::channel(16);
        let agent = Arc::new(InMemoryPrepullAgent::reporting_to(tx));
        let scheduler = Arc::new(scheduler(agent).await);
        let task = scheduler.schedule("busybox:1.36", 3, None).await.unwrap();

        let worker = PrepullWorker::new(scheduler.clone(), rx, Duration::from_millis(20));
        worker.start().await;

        let mut status = PrepullStatus::Pending;
        for _ in 0..100 {
            status = scheduler.get(&task.id).await.unwrap().status;
            if status == PrepullStatus::Completed {
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        worker.stop().await;
        assert_eq!(status, PrepullStatus::Completed);
    }
}
