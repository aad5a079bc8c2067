// ABOUTME: Prepull agent that pulls images on the local Docker daemon as a single node
// ABOUTME: Each pull runs in its own task and reports back over the worker channel

use super::{NodeReport, PrepullAgent};
use crate::substrate::docker::pull_image;
use crate::substrate::SubstrateError;
use async_trait::async_trait;
use bollard::Docker;
use liteboxd_storage::PrepullTask;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, SubstrateError>;

pub struct DockerPrepullAgent {
    client: Docker,
    node: String,
    reports: mpsc::Sender<NodeReport>,
    pulls: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
    pull_timeout: Duration,
}

impl DockerPrepullAgent {
    /// Connect to the local daemon; the node is named after the daemon host
    pub async fn connect(reports: mpsc::Sender<NodeReport>, pull_timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| SubstrateError::ConnectionError(e.to_string()))?;
        let node = match client.info().await {
            Ok(info) => info.name.unwrap_or_else(|| "local".to_string()),
            Err(e) => {
                warn!("Could not read Docker host name: {}", e);
                "local".to_string()
            }
        };
        Ok(Self::with_client(client, node, reports, pull_timeout))
    }

    pub fn with_client(
        client: Docker,
        node: String,
        reports: mpsc::Sender<NodeReport>,
        pull_timeout: Duration,
    ) -> Self {
        Self {
            client,
            node,
            reports,
            pulls: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub async fn active_pulls(&self) -> usize {
        self.pulls.read().await.len()
    }
}

#[async_trait]
impl PrepullAgent for DockerPrepullAgent {
    async fn dispatch(&self, task: &PrepullTask) -> Result<()> {
        if task.desired_nodes > 1 {
            warn!(
                "Prepull {} wants {} nodes but the Docker agent covers one",
                task.id, task.desired_nodes
            );
        }

        // hold the map while spawning so the task cannot remove itself first
        let mut pulls = self.pulls.write().await;

        let client = self.client.clone();
        let node = self.node.clone();
        let reports = self.reports.clone();
        let registry = self.pulls.clone();
        let task_id = task.id.clone();
        let image = task.image.clone();
        let timeout = self.pull_timeout;

        let handle = tokio::spawn(async move {
            let report = match pull_image(&client, &image, timeout).await {
                Ok(()) => {
                    info!("Prepull {}: {} ready on {}", task_id, image, node);
                    NodeReport::ready(&task_id, &node)
                }
                Err(e) => NodeReport::failed(&task_id, &node, e.to_string()),
            };
            if reports.send(report).await.is_err() {
                debug!("Prepull worker gone; dropping report for {}", task_id);
            }
            registry.write().await.remove(&task_id);
        });

        pulls.insert(task.id.clone(), handle);
        Ok(())
    }

    async fn cancel(&self, task_id: &str) -> Result<()> {
        if let Some(handle) = self.pulls.write().await.remove(task_id) {
            handle.abort();
            info!("Cancelled prepull {}", task_id);
        }
        Ok(())
    }
}
