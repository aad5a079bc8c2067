// ABOUTME: Sandbox control plane engine: lifecycle, drift detection, reconciliation and prepull
// ABOUTME: Wires the state store, a substrate and a prepull agent into one shared set of services

pub mod config;
pub mod drift;
pub mod error;
pub mod locks;
pub mod manager;
pub mod prepull;
pub mod reconciler;
pub mod substrate;
pub mod templates;

pub use config::{ConfigError, ControlConfig};
pub use drift::{detect, DetectorSettings, DriftItem};
pub use error::{ControlError, Result};
pub use liteboxd_storage::lifecycle;
pub use locks::SandboxLocks;
pub use manager::{CreateSandboxRequest, SandboxManager, SandboxOverrides, SubstrateEvent};
pub use prepull::{
    DockerPrepullAgent, InMemoryPrepullAgent, NodeReport, PrepullAgent, PrepullScheduler,
    PrepullWorker,
};
pub use reconciler::{ReconcileLoop, Reconciler, ReconcilerSettings};
pub use substrate::{
    DockerSubstrate, InMemorySubstrate, Substrate, SubstrateError, SubstrateSnapshot, Workload,
    WorkloadPhase, WorkloadSpec,
};
pub use templates::{
    CreateTemplateRequest, ExportFilter, ImportAction, ImportReport, ImportResult, ImportStrategy,
    RollbackResult, TemplateDocument, TemplateListDocument, TemplateMetadata, TemplatePage,
    TemplateService, UpdateTemplateRequest,
};

use sqlx::SqlitePool;
use std::sync::Arc;

/// Every service of one control plane, sharing a pool and the per-sandbox locks.
pub struct ControlPlane {
    pub manager: Arc<SandboxManager>,
    pub reconciler: Arc<Reconciler>,
    pub templates: Arc<TemplateService>,
    pub prepull: Arc<PrepullScheduler>,
}

impl ControlPlane {
    pub fn new(
        pool: SqlitePool,
        substrate: Arc<dyn Substrate>,
        agent: Arc<dyn PrepullAgent>,
        config: &ControlConfig,
    ) -> Self {
        let locks = Arc::new(SandboxLocks::new());
        let prepull = Arc::new(PrepullScheduler::new(
            pool.clone(),
            agent,
            config.prepull_timeout,
        ));

        Self {
            manager: Arc::new(SandboxManager::new(
                pool.clone(),
                substrate.clone(),
                locks.clone(),
                config.fix_timeout,
            )),
            reconciler: Arc::new(Reconciler::new(
                pool.clone(),
                substrate,
                locks,
                ReconcilerSettings::from(config),
            )),
            templates: Arc::new(
                TemplateService::new(pool).with_prepull(prepull.clone(), config.prepull_nodes),
            ),
            prepull,
        }
    }
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    liteboxd_storage::migrate(&pool).await.unwrap();
    pool
}
