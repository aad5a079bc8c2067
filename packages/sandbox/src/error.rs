// ABOUTME: Error taxonomy shared by the manager, reconciler, templates and prepull scheduler
// ABOUTME: Store and substrate errors are folded into the caller-facing categories here

use crate::substrate::SubstrateError;
use liteboxd_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    /// Malformed request, rejected before anything is written
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another run is active, or the record moved since it was read
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Substrate unavailable: {0}")]
    SubstrateUnavailable(String),

    /// A single reconcile fix failed; recorded on its item
    #[error("Fix failed: {0}")]
    FixApplication(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StorageError> for ControlError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { kind, id } => Self::NotFound { kind, id },
            StorageError::Conflict(msg) => Self::Conflict(msg),
            StorageError::InvalidTransition(e) => Self::Validation(e.to_string()),
            StorageError::InvalidValue(msg) => Self::Validation(msg),
            other => Self::Storage(other),
        }
    }
}

impl From<SubstrateError> for ControlError {
    fn from(err: SubstrateError) -> Self {
        Self::SubstrateUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
