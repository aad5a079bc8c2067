// ABOUTME: Builds the control plane for one process from environment configuration
// ABOUTME: Opens the state store and selects the Docker or in-memory substrate and prepull agent

use anyhow::{Context, Result};
use liteboxd_sandbox::{
    ControlConfig, ControlPlane, DockerPrepullAgent, DockerSubstrate, InMemoryPrepullAgent,
    InMemorySubstrate, NodeReport, PrepullAgent, Substrate,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Buffered node reports between the prepull agent and the worker
const REPORT_CHANNEL_CAPACITY: usize = 256;

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SubstrateKind {
    /// Containers on the local Docker daemon
    #[default]
    Docker,
    /// Process-local workloads, for trying the control plane without Docker
    Memory,
}

pub struct Runtime {
    pub config: ControlConfig,
    pub pool: SqlitePool,
    pub plane: ControlPlane,
    reports: Option<mpsc::Receiver<NodeReport>>,
}

impl Runtime {
    pub async fn init(kind: SubstrateKind) -> Result<Self> {
        let config = ControlConfig::from_env().context("Invalid LITEBOXD_* configuration")?;
        Self::with_config(config, kind).await
    }

    pub async fn with_config(config: ControlConfig, kind: SubstrateKind) -> Result<Self> {
        let pool = liteboxd_storage::connect(&config.database_url)
            .await
            .with_context(|| format!("Failed to open state store at {}", config.database_url))?;

        let (reports_tx, reports_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        let (substrate, agent): (Arc<dyn Substrate>, Arc<dyn PrepullAgent>) = match kind {
            SubstrateKind::Docker => {
                let substrate =
                    DockerSubstrate::new().context("Failed to configure Docker client")?;
                let agent = DockerPrepullAgent::connect(reports_tx, config.prepull_timeout)
                    .await
                    .context("Failed to start Docker prepull agent")?;
                info!("Using Docker substrate (prepull node {})", agent.node());
                (
                    Arc::new(substrate) as Arc<dyn Substrate>,
                    Arc::new(agent) as Arc<dyn PrepullAgent>,
                )
            }
            SubstrateKind::Memory => {
                info!("Using in-memory substrate");
                (
                    Arc::new(InMemorySubstrate::new()) as Arc<dyn Substrate>,
                    Arc::new(InMemoryPrepullAgent::reporting_to(reports_tx)) as Arc<dyn PrepullAgent>,
                )
            }
        };

        let plane = ControlPlane::new(pool.clone(), substrate, agent, &config);
        Ok(Self {
            config,
            pool,
            plane,
            reports: Some(reports_rx),
        })
    }

    /// The receiving end of the agent's node reports; only the first caller gets it
    pub fn take_reports(&mut self) -> Option<mpsc::Receiver<NodeReport>> {
        self.reports.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liteboxd_sandbox::CreateTemplateRequest;
    use liteboxd_storage::TemplateSpec;
    use tempfile::TempDir;

    fn file_config(dir: &TempDir) -> ControlConfig {
        ControlConfig {
            database_url: format!("sqlite://{}", dir.path().join("liteboxd.db").display()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_memory_runtime_persists_to_file() {
        let dir = TempDir::new().unwrap();

        let runtime = Runtime::with_config(file_config(&dir), SubstrateKind::Memory)
            .await
            .unwrap();
        runtime
            .plane
            .templates
            .create(CreateTemplateRequest {
                name: "python".to_string(),
                spec: TemplateSpec {
                    image: "python:3.12-slim".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        runtime.pool.close().await;

        // a second process sees what the first one wrote
        let reopened = Runtime::with_config(file_config(&dir), SubstrateKind::Memory)
            .await
            .unwrap();
        let template = reopened.plane.templates.get("python").await.unwrap();
        assert_eq!(template.latest_version, 1);
    }

    #[tokio::test]
    async fn test_reports_taken_once() {
        let dir = TempDir::new().unwrap();
        let mut runtime = Runtime::with_config(file_config(&dir), SubstrateKind::Memory)
            .await
            .unwrap();

        assert!(runtime.take_reports().is_some());
        assert!(runtime.take_reports().is_none());
    }
}
