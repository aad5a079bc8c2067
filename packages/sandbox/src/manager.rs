// ABOUTME: API-facing mutation path for sandboxes: create, desired state, delete, substrate events
// ABOUTME: Every write for one sandbox runs under that sandbox's lock, shared with the reconciler

use crate::error::{ControlError, Result};
use crate::locks::SandboxLocks;
use crate::substrate::{Substrate, WorkloadPhase, WorkloadSpec};
use crate::templates::{DEFAULT_CPU, DEFAULT_MEMORY, DEFAULT_TTL_SECS};
use chrono::{DateTime, Utc};
use liteboxd_storage::lifecycle::can_transition;
use liteboxd_storage::{
    DesiredState, HistorySource, LifecycleStatus, NewSandbox, Sandbox, SandboxFilter, SandboxPage,
    SandboxStore, StatusHistoryItem, TemplateStore, TemplateVersion, TransitionRequest,
    MAX_TTL_SECS,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-sandbox changes on top of the template spec
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxOverrides {
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub ttl: Option<i64>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Request to create a new sandbox
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    pub template: String,
    /// Latest version when absent
    pub template_version: Option<i64>,
    #[serde(default)]
    pub overrides: SandboxOverrides,
}

/// A state change pushed by the substrate outside of a reconcile pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstrateEvent {
    pub sandbox_id: String,
    pub phase: WorkloadPhase,
    pub ip: Option<String>,
    pub observed_at: DateTime<Utc>,
}

pub struct SandboxManager {
    sandboxes: SandboxStore,
    templates: TemplateStore,
    substrate: Arc<dyn Substrate>,
    locks: Arc<SandboxLocks>,
    create_timeout: Duration,
}

impl SandboxManager {
    pub fn new(
        pool: SqlitePool,
        substrate: Arc<dyn Substrate>,
        locks: Arc<SandboxLocks>,
        create_timeout: Duration,
    ) -> Self {
        Self {
            sandboxes: SandboxStore::new(pool.clone()),
            templates: TemplateStore::new(pool),
            substrate,
            locks,
            create_timeout,
        }
    }

    // ========================================================================
    // MUTATIONS
    // ========================================================================

    /// Record a sandbox and start its workload.
    ///
    /// A failed substrate create leaves the record in `error` rather than
    /// removing it; the reconciler retries creation.
    pub async fn create_sandbox(&self, request: CreateSandboxRequest) -> Result<Sandbox> {
        let version = self
            .resolve_version(&request.template, request.template_version)
            .await?;
        let spec = &version.spec;
        let overrides = request.overrides;

        let ttl = overrides.ttl.unwrap_or(if spec.ttl > 0 {
            spec.ttl
        } else {
            DEFAULT_TTL_SECS
        });
        if !(1..=MAX_TTL_SECS).contains(&ttl) {
            return Err(ControlError::Validation(format!(
                "ttl must be between 1 and {} seconds, got {}",
                MAX_TTL_SECS, ttl
            )));
        }
        if spec.image.trim().is_empty() {
            return Err(ControlError::Validation(format!(
                "template {} v{} has no image",
                request.template, version.version
            )));
        }

        let mut env = spec.env.clone();
        env.extend(overrides.env);

        let new = NewSandbox {
            id: None,
            template_name: Some(request.template.clone()),
            template_version: Some(version.version),
            image: spec.image.clone(),
            cpu: overrides
                .cpu
                .or_else(|| non_empty(&spec.resources.cpu))
                .unwrap_or_else(|| DEFAULT_CPU.to_string()),
            memory: overrides
                .memory
                .or_else(|| non_empty(&spec.resources.memory))
                .unwrap_or_else(|| DEFAULT_MEMORY.to_string()),
            ttl_seconds: ttl,
            env,
        };

        let sandbox = self.sandboxes.insert_sandbox(new).await?;
        let _guard = self.locks.lock(&sandbox.id).await;

        let workload =
            WorkloadSpec::from_sandbox(&sandbox).with_startup_script(spec.startup_script.clone());
        let failure = match tokio::time::timeout(self.create_timeout, self.substrate.create(&workload))
            .await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("timed out after {:?}", self.create_timeout)),
        };

        match failure {
            None => {
                info!(
                    "Created sandbox {} from {} v{}",
                    sandbox.id, request.template, version.version
                );
                Ok(sandbox)
            }
            Some(reason) => {
                warn!("Substrate create failed for sandbox {}: {}", sandbox.id, reason);
                let request = TransitionRequest::new(
                    LifecycleStatus::Error,
                    HistorySource::Api,
                    format!("create failed: {}", reason),
                )
                .expecting(sandbox.revision);
                Ok(self
                    .sandboxes
                    .record_lifecycle_transition(&sandbox.id, request)
                    .await?)
            }
        }
    }

    /// Set the operator's intent from a raw request value
    pub async fn set_desired_state(&self, id: &str, raw_state: &str) -> Result<Sandbox> {
        let state = DesiredState::from_str(raw_state.trim())
            .map_err(|e| ControlError::Validation(e.to_string()))?;

        let _guard = self.locks.lock(id).await;
        let current = self.sandboxes.get_sandbox(id).await?;

        if state == DesiredState::Running && current.lifecycle_status == LifecycleStatus::Terminated
        {
            return Err(ControlError::Validation(format!(
                "sandbox {} is terminated and cannot run again",
                id
            )));
        }

        Ok(self
            .sandboxes
            .upsert_desired_state(id, state, Some(current.revision))
            .await?)
    }

    /// Mark for deletion and try to stop the workload right away. Failures to
    /// stop are left for the reconciler.
    pub async fn delete_sandbox(&self, id: &str) -> Result<Sandbox> {
        let _guard = self.locks.lock(id).await;
        let current = self.sandboxes.get_sandbox(id).await?;
        let record = self
            .sandboxes
            .upsert_desired_state(id, DesiredState::Deleted, Some(current.revision))
            .await?;

        if !can_transition(record.lifecycle_status, LifecycleStatus::Terminating) {
            return Ok(record);
        }

        match tokio::time::timeout(self.create_timeout, self.substrate.terminate(id)).await {
            Ok(Ok(())) => {
                let request = TransitionRequest::new(
                    LifecycleStatus::Terminating,
                    HistorySource::Api,
                    "deleted by operator",
                )
                .expecting(record.revision);
                Ok(self
                    .sandboxes
                    .record_lifecycle_transition(id, request)
                    .await?)
            }
            Ok(Err(e)) => {
                warn!("Terminate failed for sandbox {}: {}", id, e);
                Ok(record)
            }
            Err(_) => {
                warn!("Terminate timed out for sandbox {}", id);
                Ok(record)
            }
        }
    }

    /// Apply a pushed substrate observation. Events older than the last
    /// observation are ignored.
    pub async fn apply_substrate_event(&self, event: SubstrateEvent) -> Result<Sandbox> {
        let _guard = self.locks.lock(&event.sandbox_id).await;
        let current = self.sandboxes.get_sandbox(&event.sandbox_id).await?;

        if let Some(seen) = current.last_seen_at {
            if event.observed_at < seen {
                debug!(
                    "Ignoring {} event for {}: older than last observation",
                    event.phase, event.sandbox_id
                );
                return Ok(current);
            }
        }

        let target = event
            .phase
            .lifecycle()
            .filter(|status| *status != current.lifecycle_status);
        if let Some(to) = target {
            if !can_transition(current.lifecycle_status, to) {
                return Err(ControlError::Validation(format!(
                    "substrate event {} -> {} is not a legal transition for {}",
                    current.lifecycle_status, to, event.sandbox_id
                )));
            }
        }

        self.sandboxes
            .record_observation(
                &event.sandbox_id,
                event.phase.as_str(),
                event.ip.as_deref(),
                event.observed_at,
            )
            .await?;

        match target {
            Some(to) => {
                let request = TransitionRequest::new(
                    to,
                    HistorySource::SubstrateEvent,
                    format!("substrate reports {}", event.phase),
                )
                .with_payload(json!({
                    "pod_phase": event.phase.as_str(),
                    "pod_ip": event.ip,
                    "observed_at": event.observed_at.to_rfc3339(),
                }))
                .expecting(current.revision);
                Ok(self
                    .sandboxes
                    .record_lifecycle_transition(&event.sandbox_id, request)
                    .await?)
            }
            None => Ok(self.sandboxes.get_sandbox(&event.sandbox_id).await?),
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    pub async fn get_sandbox(&self, id: &str) -> Result<Sandbox> {
        Ok(self.sandboxes.get_sandbox(id).await?)
    }

    pub async fn list_sandboxes(&self, filter: &SandboxFilter) -> Result<SandboxPage> {
        Ok(self.sandboxes.list_sandboxes(filter).await?)
    }

    pub async fn list_status_history(
        &self,
        id: &str,
        before_id: Option<i64>,
        limit: Option<u32>,
    ) -> Result<Vec<StatusHistoryItem>> {
        Ok(self
            .sandboxes
            .list_status_history(id, before_id, limit)
            .await?)
    }

    async fn resolve_version(&self, template: &str, version: Option<i64>) -> Result<TemplateVersion> {
        let version = match version {
            Some(v) => v,
            None => self.templates.get_template(template).await?.latest_version,
        };
        Ok(self.templates.get_version(template, version).await?)
    }
}

/// Workload spec for an existing record, with the startup script of the
/// template version it was created from when that version still exists.
pub(crate) async fn workload_spec_for(sandbox: &Sandbox, templates: &TemplateStore) -> WorkloadSpec {
    let script = match (&sandbox.template_name, sandbox.template_version) {
        (Some(name), Some(version)) => match templates.get_version(name, version).await {
            Ok(found) => found.spec.startup_script,
            Err(e) => {
                debug!("No template spec for sandbox {}: {}", sandbox.id, e);
                None
            }
        },
        _ => None,
    };
    WorkloadSpec::from_sandbox(sandbox).with_startup_script(script)
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
