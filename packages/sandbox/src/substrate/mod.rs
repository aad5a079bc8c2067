// ABOUTME: Substrate trait: read-only snapshot of workloads plus create/terminate commands
// ABOUTME: Implementations run sandboxes on Docker or entirely in memory

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use liteboxd_storage::{LifecycleStatus, Sandbox};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

pub mod docker;
pub mod memory;

pub use docker::DockerSubstrate;
pub use memory::InMemorySubstrate;

#[derive(Error, Debug, Clone)]
pub enum SubstrateError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Workload error: {0}")]
    WorkloadError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Provider not available: {0}")]
    NotAvailable(String),
}

pub type Result<T> = std::result::Result<T, SubstrateError>;

/// Substrate-level phase of a workload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Terminating,
    Unknown,
}

impl WorkloadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Terminating => "Terminating",
            Self::Unknown => "Unknown",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "terminating" => Some(Self::Terminating),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// The lifecycle status this phase implies, if any.
    pub fn lifecycle(&self) -> Option<LifecycleStatus> {
        match self {
            Self::Pending => Some(LifecycleStatus::Pending),
            Self::Running => Some(LifecycleStatus::Running),
            Self::Terminating => Some(LifecycleStatus::Terminating),
            Self::Succeeded => Some(LifecycleStatus::Terminated),
            Self::Failed => Some(LifecycleStatus::Error),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workload {
    /// Substrate-native id, equal to the sandbox id
    pub id: String,
    pub phase: WorkloadPhase,
    pub ip: Option<String>,
    pub last_transition_at: DateTime<Utc>,
}

/// One read of the substrate. Valid for a single reconcile pass only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubstrateSnapshot {
    pub workloads: Vec<Workload>,
    /// Some workloads could not be observed; absence proves nothing
    pub incomplete: bool,
    pub warnings: Vec<String>,
    pub taken_at: DateTime<Utc>,
}

impl SubstrateSnapshot {
    pub fn complete(workloads: Vec<Workload>) -> Self {
        Self {
            workloads,
            incomplete: false,
            warnings: Vec::new(),
            taken_at: Utc::now(),
        }
    }
}

/// Everything the substrate needs to start a sandbox workload.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    pub id: String,
    pub image: String,
    pub cpu: String,
    pub memory: String,
    pub env: HashMap<String, String>,
    pub startup_script: Option<String>,
}

impl WorkloadSpec {
    pub fn from_sandbox(sandbox: &Sandbox) -> Self {
        Self {
            id: sandbox.id.clone(),
            image: sandbox.image.clone(),
            cpu: sandbox.cpu.clone(),
            memory: sandbox.memory.clone(),
            env: sandbox.env.clone(),
            startup_script: None,
        }
    }

    pub fn with_startup_script(mut self, script: Option<String>) -> Self {
        self.startup_script = script;
        self
    }
}

#[async_trait]
pub trait Substrate: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Observe every managed workload. Never mutates the substrate.
    async fn snapshot(&self) -> Result<SubstrateSnapshot>;

    /// Create and start the workload for a sandbox
    async fn create(&self, spec: &WorkloadSpec) -> Result<()>;

    /// Remove a workload. Removing an absent workload succeeds.
    async fn terminate(&self, id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_lifecycle_mapping() {
        assert_eq!(
            WorkloadPhase::Pending.lifecycle(),
            Some(LifecycleStatus::Pending)
        );
        assert_eq!(
            WorkloadPhase::Running.lifecycle(),
            Some(LifecycleStatus::Running)
        );
        assert_eq!(
            WorkloadPhase::Succeeded.lifecycle(),
            Some(LifecycleStatus::Terminated)
        );
        assert_eq!(
            WorkloadPhase::Failed.lifecycle(),
            Some(LifecycleStatus::Error)
        );
        assert_eq!(
            WorkloadPhase::Terminating.lifecycle(),
            Some(LifecycleStatus::Terminating)
        );
        assert_eq!(WorkloadPhase::Unknown.lifecycle(), None);
    }

    #[test]
    fn test_phase_parsing_is_case_insensitive() {
        assert_eq!(WorkloadPhase::from_str("running"), Some(WorkloadPhase::Running));
        assert_eq!(WorkloadPhase::from_str("Succeeded"), Some(WorkloadPhase::Succeeded));
        assert_eq!(WorkloadPhase::from_str("exploded"), None);
    }
}
