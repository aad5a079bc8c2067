// ABOUTME: Reconciliation passes: snapshot, detect drift, apply fixes and audit every outcome
// ABOUTME: Runs are serialized behind one gate; fixes run in parallel under per-sandbox locks

use crate::config::ControlConfig;
use crate::drift::{detect, DetectorSettings, DriftItem};
use crate::error::{ControlError, Result};
use crate::locks::SandboxLocks;
use crate::manager::workload_spec_for;
use crate::substrate::{Substrate, SubstrateSnapshot};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use liteboxd_storage::lifecycle::{can_transition, transition_path};
use liteboxd_storage::{
    DesiredState, DriftType, FixOutcome, HistorySource, LifecycleStatus, NewReconcileItem,
    ReconcileRun, ReconcileRunDetail, ReconcileStore, RunStatus, RunSummary, Sandbox,
    SandboxStore, TemplateStore, TransitionRequest, TriggerType,
};
use serde_json::json;
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerSettings {
    pub detector: DetectorSettings,
    /// Deadline for each substrate call made by a fix
    pub fix_timeout: Duration,
    pub fix_concurrency: usize,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self::from(&ControlConfig::default())
    }
}

impl From<&ControlConfig> for ReconcilerSettings {
    fn from(config: &ControlConfig) -> Self {
        Self {
            detector: config.detector_settings(),
            fix_timeout: config.fix_timeout,
            fix_concurrency: config.fix_concurrency,
        }
    }
}

pub struct Reconciler {
    sandboxes: SandboxStore,
    runs: ReconcileStore,
    templates: TemplateStore,
    substrate: Arc<dyn Substrate>,
    locks: Arc<SandboxLocks>,
    settings: ReconcilerSettings,
    gate: Arc<Mutex<()>>,
}

impl Reconciler {
    pub fn new(
        pool: SqlitePool,
        substrate: Arc<dyn Substrate>,
        locks: Arc<SandboxLocks>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            sandboxes: SandboxStore::new(pool.clone()),
            runs: ReconcileStore::new(pool.clone()),
            templates: TemplateStore::new(pool),
            substrate,
            locks,
            settings,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Run a pass now and return it sealed.
    ///
    /// Rejected with `Conflict` while another pass is active. The pass runs on
    /// its own task, so dropping the returned future stops the wait but not
    /// the pass.
    pub async fn trigger_manual(self: &Arc<Self>) -> Result<ReconcileRunDetail> {
        let guard = self.gate.clone().try_lock_owned().map_err(|_| {
            ControlError::Conflict("a reconcile run is already in progress".to_string())
        })?;

        let reconciler = self.clone();
        let pass = tokio::spawn(async move {
            let _guard = guard;
            reconciler.run_pass(TriggerType::Manual).await
        });

        pass.await
            .map_err(|e| ControlError::Internal(format!("reconcile task failed: {}", e)))?
    }

    /// Run a scheduled pass unless one is already active, in which case `None`.
    pub async fn trigger_scheduled(&self) -> Option<Result<ReconcileRunDetail>> {
        let _guard = self.gate.try_lock().ok()?;
        Some(self.run_pass(TriggerType::Scheduled).await)
    }

    pub async fn list_runs(&self, limit: Option<u32>) -> Result<Vec<ReconcileRun>> {
        Ok(self.runs.list_reconcile_runs(limit).await?)
    }

    pub async fn get_run_detail(&self, id: &str) -> Result<ReconcileRunDetail> {
        Ok(self.runs.get_reconcile_run_detail(id).await?)
    }

    // ========================================================================
    // PASS
    // ========================================================================

    async fn run_pass(&self, trigger: TriggerType) -> Result<ReconcileRunDetail> {
        let run = self.runs.create_reconcile_run(trigger).await?;
        info!("Reconcile run {} started ({})", run.id, trigger.as_str());

        let records = match self.sandboxes.list_reconcilable().await {
            Ok(records) => records,
            Err(e) => {
                error!("Reconcile run {}: failed to load sandboxes: {}", run.id, e);
                let summary = RunSummary {
                    status: RunStatus::Failed,
                    total_db: 0,
                    total_substrate: 0,
                    error: Some(format!("failed to load sandboxes: {}", e)),
                };
                if let Err(seal_err) = self.runs.seal_reconcile_run(&run.id, summary).await {
                    error!("Failed to seal reconcile run {}: {}", run.id, seal_err);
                }
                return Err(e.into());
            }
        };

        let snapshot = match self.substrate.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    "Reconcile run {}: {} snapshot failed: {}",
                    run.id,
                    self.substrate.name(),
                    e
                );
                let summary = RunSummary {
                    status: RunStatus::Failed,
                    total_db: records.len() as i64,
                    total_substrate: 0,
                    error: Some(format!("substrate snapshot failed: {}", e)),
                };
                self.runs.seal_reconcile_run(&run.id, summary).await?;
                return Ok(self.runs.get_reconcile_run_detail(&run.id).await?);
            }
        };

        if snapshot.incomplete {
            warn!(
                "Reconcile run {}: snapshot incomplete, skipping absence checks: {}",
                run.id,
                snapshot.warnings.join("; ")
            );
        }

        self.record_observations(&records, &snapshot).await;

        let drift = detect(
            &records,
            &snapshot,
            Utc::now(),
            &self.settings.detector,
        );
        debug!("Reconcile run {}: {} drift items", run.id, drift.len());

        let snapshot = &snapshot;
        let mut fixes = stream::iter(drift)
            .map(|item| async move {
                let (outcome, detail) = self.apply_fix(&item, snapshot).await;
                (item, outcome, detail)
            })
            .buffered(self.settings.fix_concurrency.max(1));

        while let Some((item, outcome, detail)) = fixes.next().await {
            let appended = self
                .runs
                .append_reconcile_item(NewReconcileItem {
                    run_id: run.id.clone(),
                    sandbox_id: item.sandbox_id.clone(),
                    drift_type: item.drift_type,
                    action: item.action,
                    outcome,
                    detail,
                })
                .await;
            if let Err(e) = appended {
                error!(
                    "Reconcile run {}: failed to record item for {}: {}",
                    run.id, item.sandbox_id, e
                );
            }
        }

        let summary = RunSummary {
            status: RunStatus::Completed,
            total_db: records.len() as i64,
            total_substrate: snapshot.workloads.len() as i64,
            error: snapshot
                .incomplete
                .then(|| format!("snapshot incomplete: {}", snapshot.warnings.join("; "))),
        };
        let sealed = self.runs.seal_reconcile_run(&run.id, summary).await?;
        info!(
            "Reconcile run {} completed ({}): {} drift, {} fixed",
            sealed.id,
            trigger.as_str(),
            sealed.drift_count,
            sealed.fixed_count
        );

        Ok(self.runs.get_reconcile_run_detail(&run.id).await?)
    }

    async fn record_observations(&self, records: &[Sandbox], snapshot: &SubstrateSnapshot) {
        for workload in &snapshot.workloads {
            if !records.iter().any(|r| r.id == workload.id) {
                continue;
            }
            if let Err(e) = self
                .sandboxes
                .record_observation(
                    &workload.id,
                    workload.phase.as_str(),
                    workload.ip.as_deref(),
                    snapshot.taken_at,
                )
                .await
            {
                warn!("Failed to record observation for {}: {}", workload.id, e);
            }
        }
    }

    // ========================================================================
    // FIXES
    // ========================================================================

    async fn apply_fix(
        &self,
        item: &DriftItem,
        snapshot: &SubstrateSnapshot,
    ) -> (FixOutcome, String) {
        match self.try_fix(item, snapshot).await {
            Ok(done) => (FixOutcome::Fixed, format!("{}; {}", item.detail, done)),
            Err(ControlError::Conflict(reason)) => {
                debug!("Skipped {} for {}: {}", item.action, item.sandbox_id, reason);
                (
                    FixOutcome::Skipped,
                    format!("{}; skipped: {}", item.detail, reason),
                )
            }
            Err(ControlError::FixApplication(reason)) => {
                warn!("Fix {} for sandbox {} failed: {}", item.action, item.sandbox_id, reason);
                (FixOutcome::Failed, format!("{}; failed: {}", item.detail, reason))
            }
            Err(e) => {
                warn!("Fix {} for sandbox {} failed: {}", item.action, item.sandbox_id, e);
                (FixOutcome::Failed, format!("{}; failed: {}", item.detail, e))
            }
        }
    }

    async fn try_fix(&self, item: &DriftItem, snapshot: &SubstrateSnapshot) -> Result<String> {
        let _guard = self.locks.lock(&item.sandbox_id).await;

        let current = match self.sandboxes.get_sandbox(&item.sandbox_id).await {
            Ok(record) => Some(record),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        match item.drift_type {
            DriftType::Expired => self.mark_deleted(current).await,
            DriftType::OrphanInSubstrate => self.terminate_orphan(item, current).await,
            DriftType::MissingInSubstrate => {
                let record = revalidate(item, current)?;
                self.recreate(record).await
            }
            DriftType::StaleStatus => {
                let record = revalidate(item, current)?;
                self.update_status(item, record, snapshot).await
            }
        }
    }

    async fn mark_deleted(&self, current: Option<Sandbox>) -> Result<String> {
        let record = current.ok_or_else(gone)?;
        // expiry only depends on expires_at, so the predicate itself is the check
        if record.desired_state == DesiredState::Deleted {
            return Err(ControlError::Conflict("already marked deleted".to_string()));
        }
        if !record.is_expired(Utc::now()) {
            return Err(ControlError::Conflict("no longer expired".to_string()));
        }

        self.sandboxes
            .upsert_desired_state(&record.id, DesiredState::Deleted, Some(record.revision))
            .await?;
        Ok("desired_state -> deleted".to_string())
    }

    async fn terminate_orphan(&self, item: &DriftItem, current: Option<Sandbox>) -> Result<String> {
        match (&current, item.observed_revision) {
            (Some(record), None) if record.desired_state == DesiredState::Running => {
                return Err(ControlError::Conflict(
                    "a record appeared for the workload".to_string(),
                ));
            }
            (Some(record), Some(revision)) if record.revision != revision => {
                return Err(stale_revision(revision, record.revision));
            }
            _ => {}
        }

        self.with_deadline("terminate", self.substrate.terminate(&item.sandbox_id))
            .await?;

        if let Some(record) = current {
            if can_transition(record.lifecycle_status, LifecycleStatus::Terminating) {
                let request = TransitionRequest::new(
                    LifecycleStatus::Terminating,
                    HistorySource::Reconciler,
                    "orphaned workload terminated",
                )
                .expecting(record.revision);
                self.sandboxes
                    .record_lifecycle_transition(&record.id, request)
                    .await?;
            }
        }
        Ok("workload terminated".to_string())
    }

    async fn recreate(&self, record: Sandbox) -> Result<String> {
        let spec = workload_spec_for(&record, &self.templates).await;

        let record = match record.lifecycle_status {
            LifecycleStatus::Pending | LifecycleStatus::Error => record,
            _ => {
                let request = TransitionRequest::new(
                    LifecycleStatus::Error,
                    HistorySource::Reconciler,
                    "workload missing from substrate",
                )
                .expecting(record.revision);
                self.sandboxes
                    .record_lifecycle_transition(&record.id, request)
                    .await?
            }
        };

        self.with_deadline("create", self.substrate.create(&spec))
            .await?;

        if record.lifecycle_status == LifecycleStatus::Error {
            let request = TransitionRequest::new(
                LifecycleStatus::Pending,
                HistorySource::Reconciler,
                "workload recreated",
            )
            .expecting(record.revision);
            self.sandboxes
                .record_lifecycle_transition(&record.id, request)
                .await?;
        }
        Ok("workload recreated".to_string())
    }

    async fn update_status(
        &self,
        item: &DriftItem,
        record: Sandbox,
        snapshot: &SubstrateSnapshot,
    ) -> Result<String> {
        // most recent observation wins
        if let Some(seen) = record.last_seen_at {
            if seen > snapshot.taken_at {
                return Err(ControlError::Conflict(format!(
                    "newer observation at {} supersedes snapshot",
                    seen.to_rfc3339()
                )));
            }
        }

        let target = item.target_status.ok_or_else(|| {
            ControlError::Internal(format!("stale-status drift for {} has no target", item.sandbox_id))
        })?;
        let steps = transition_path(record.lifecycle_status, target).ok_or_else(|| {
            ControlError::Conflict(format!(
                "lifecycle_status {} can no longer reach {}",
                record.lifecycle_status, target
            ))
        })?;
        let reason = match item.observed_phase {
            Some(phase) => format!("substrate reports {}", phase),
            None => "workload absent from substrate".to_string(),
        };

        let from = record.lifecycle_status;
        let mut current = record;
        for step in steps {
            let request = TransitionRequest::new(step, HistorySource::Reconciler, reason.clone())
                .with_payload(json!({
                    "pod_phase": item.observed_phase.map(|p| p.as_str()),
                    "pod_ip": item.observed_ip,
                }))
                .expecting(current.revision);
            current = self
                .sandboxes
                .record_lifecycle_transition(&current.id, request)
                .await?;
        }
        Ok(format!("lifecycle_status {} -> {}", from, target))
    }

    async fn with_deadline<T, F>(&self, what: &str, call: F) -> Result<T>
    where
        F: Future<Output = crate::substrate::Result<T>>,
    {
        match time::timeout(self.settings.fix_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ControlError::FixApplication(format!("{} failed: {}", what, e))),
            Err(_) => Err(ControlError::FixApplication(format!(
                "{} exceeded deadline of {:?}",
                what, self.settings.fix_timeout
            ))),
        }
    }
}

fn gone() -> ControlError {
    ControlError::Conflict("sandbox no longer exists".to_string())
}

fn stale_revision(expected: i64, actual: i64) -> ControlError {
    ControlError::Conflict(format!(
        "record changed since detection (revision {} -> {})",
        expected, actual
    ))
}

/// The fix only proceeds if the record is still what the detector saw.
fn revalidate(item: &DriftItem, current: Option<Sandbox>) -> Result<Sandbox> {
    let record = current.ok_or_else(gone)?;
    match item.observed_revision {
        Some(revision) if revision != record.revision => {
            Err(stale_revision(revision, record.revision))
        }
        _ => Ok(record),
    }
}

/// Scheduled trigger: one pass per interval until stopped.
pub struct ReconcileLoop {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    running: Arc<RwLock<bool>>,
}

impl ReconcileLoop {
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let reconciler = self.reconciler.clone();
        let running_flag = self.running.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            info!("Reconcile loop started (every {:?})", interval);

            loop {
                if !*running_flag.read().await {
                    info!("Reconcile loop stopped");
                    break;
                }

                match reconciler.trigger_scheduled().await {
                    None => info!("Skipping scheduled reconcile: a run is already in progress"),
                    Some(Ok(detail)) => debug!(
                        "Scheduled reconcile {} sealed {}",
                        detail.run.id,
                        detail.run.status.as_str()
                    ),
                    Some(Err(e)) => error!("Scheduled reconcile failed: {}", e),
                }

                time::sleep(interval).await;
            }
        });
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
