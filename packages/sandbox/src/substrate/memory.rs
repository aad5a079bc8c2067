// ABOUTME: In-process substrate holding workloads in memory with scriptable failures
// ABOUTME: Backs engine tests and the CLI's `--substrate memory` mode

use super::{
    Result, Substrate, SubstrateError, SubstrateSnapshot, Workload, WorkloadPhase, WorkloadSpec,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

#[derive(Debug, Default)]
struct Faults {
    snapshot_error: Option<String>,
    incomplete: Option<Vec<String>>,
    create_error: Option<String>,
    terminate_error: Option<String>,
    create_delay: Option<Duration>,
    terminate_delay: Option<Duration>,
}

/// Substrate that keeps its workloads in a map.
#[derive(Default)]
pub struct InMemorySubstrate {
    workloads: RwLock<BTreeMap<String, Workload>>,
    faults: RwLock<Faults>,
    created: RwLock<Vec<String>>,
    terminated: RwLock<Vec<String>>,
    create_calls: AtomicU32,
    next_ip: AtomicU32,
    snapshot_gate: Option<Arc<Notify>>,
    snapshot_entered: Arc<Notify>,
    create_gate: Option<Arc<Notify>>,
    create_entered: Arc<Notify>,
}

impl InMemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every snapshot waits on `gate` after announcing itself on `snapshot_entered`
    pub fn with_snapshot_gate(mut self, gate: Arc<Notify>) -> Self {
        self.snapshot_gate = Some(gate);
        self
    }

    pub fn snapshot_entered(&self) -> Arc<Notify> {
        self.snapshot_entered.clone()
    }

    /// Every create waits on `gate` after announcing itself on `create_entered`
    pub fn with_create_gate(mut self, gate: Arc<Notify>) -> Self {
        self.create_gate = Some(gate);
        self
    }

    pub fn create_entered(&self) -> Arc<Notify> {
        self.create_entered.clone()
    }

    /// Calls to `create`, including failed and abandoned ones
    pub fn create_attempts(&self) -> u32 {
        self.create_calls.load(Ordering::Relaxed)
    }

    pub async fn insert_workload(&self, workload: Workload) {
        self.workloads
            .write()
            .await
            .insert(workload.id.clone(), workload);
    }

    pub async fn set_phase(&self, id: &str, phase: WorkloadPhase) {
        if let Some(workload) = self.workloads.write().await.get_mut(id) {
            workload.phase = phase;
            workload.last_transition_at = Utc::now();
        }
    }

    pub async fn remove_workload(&self, id: &str) -> Option<Workload> {
        self.workloads.write().await.remove(id)
    }

    pub async fn workload(&self, id: &str) -> Option<Workload> {
        self.workloads.read().await.get(id).cloned()
    }

    pub async fn workloads(&self) -> Vec<Workload> {
        self.workloads.read().await.values().cloned().collect()
    }

    /// Ids passed to successful `create` calls, in call order
    pub async fn created(&self) -> Vec<String> {
        self.created.read().await.clone()
    }

    /// Ids passed to successful `terminate` calls, in call order
    pub async fn terminated(&self) -> Vec<String> {
        self.terminated.read().await.clone()
    }

    pub async fn fail_snapshot(&self, error: Option<&str>) {
        self.faults.write().await.snapshot_error = error.map(str::to_string);
    }

    pub async fn mark_incomplete(&self, warnings: Option<Vec<String>>) {
        self.faults.write().await.incomplete = warnings;
    }

    pub async fn fail_create(&self, error: Option<&str>) {
        self.faults.write().await.create_error = error.map(str::to_string);
    }

    pub async fn fail_terminate(&self, error: Option<&str>) {
        self.faults.write().await.terminate_error = error.map(str::to_string);
    }

    pub async fn delay_create(&self, delay: Option<Duration>) {
        self.faults.write().await.create_delay = delay;
    }

    pub async fn delay_terminate(&self, delay: Option<Duration>) {
        self.faults.write().await.terminate_delay = delay;
    }

    fn allocate_ip(&self) -> String {
        let n = self.next_ip.fetch_add(1, Ordering::Relaxed) + 2;
        format!("10.88.{}.{}", (n >> 8) & 0xff, n & 0xff)
    }
}

#[async_trait]
impl Substrate for InMemorySubstrate {
    fn name(&self) -> &str {
        "memory"
    }

    async fn snapshot(&self) -> Result<SubstrateSnapshot> {
        if let Some(gate) = &self.snapshot_gate {
            self.snapshot_entered.notify_one();
            gate.notified().await;
        }

        let taken_at = Utc::now();
        let faults = self.faults.read().await;
        if let Some(error) = &faults.snapshot_error {
            return Err(SubstrateError::ConnectionError(error.clone()));
        }

        let workloads = self.workloads.read().await.values().cloned().collect();
        let warnings = faults.incomplete.clone().unwrap_or_default();

        Ok(SubstrateSnapshot {
            workloads,
            incomplete: faults.incomplete.is_some(),
            warnings,
            taken_at,
        })
    }

    async fn create(&self, spec: &WorkloadSpec) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(gate) = &self.create_gate {
            self.create_entered.notify_one();
            gate.notified().await;
        }

        let (delay, error) = {
            let faults = self.faults.read().await;
            (faults.create_delay, faults.create_error.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = error {
            return Err(SubstrateError::WorkloadError(error));
        }

        let workload = Workload {
            id: spec.id.clone(),
            phase: WorkloadPhase::Running,
            ip: Some(self.allocate_ip()),
            last_transition_at: Utc::now(),
        };
        debug!("memory substrate: created {}", spec.id);
        self.workloads
            .write()
            .await
            .insert(spec.id.clone(), workload);
        self.created.write().await.push(spec.id.clone());
        Ok(())
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        let (delay, error) = {
            let faults = self.faults.read().await;
            (faults.terminate_delay, faults.terminate_error.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = error {
            return Err(SubstrateError::WorkloadError(error));
        }

        self.workloads.write().await.remove(id);
        self.terminated.write().await.push(id.to_string());
        Ok(())
    }
}
