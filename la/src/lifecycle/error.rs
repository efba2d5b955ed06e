//! Lifecycle controller errors

use thiserror::Error;

use crate::workload::WorkloadError;

/// Errors from lifecycle operations
///
/// All of these are recoverable: the command that hit them is abandoned and
/// the controller keeps its prior state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("Workload is not initialised")]
    NotInitialised,

    #[error("Workload shutdown failed: {0}")]
    ShutdownFailed(String),

    #[error("Invalid workload configuration: {0}")]
    ConfigParse(String),

    #[error("Workload error: {0}")]
    Workload(String),
}

impl From<WorkloadError> for ControlError {
    fn from(err: WorkloadError) -> Self {
        match err {
            WorkloadError::Config(msg) => ControlError::ConfigParse(msg),
            WorkloadError::ShutdownFailed(msg) => ControlError::ShutdownFailed(msg),
            WorkloadError::Start(msg) => ControlError::Workload(msg),
        }
    }
}
