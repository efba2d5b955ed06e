//! Workload capability boundary
//!
//! The lifecycle controller drives a workload only through the [`Workload`] and
//! [`WorkloadFactory`] traits, so the control plane can be exercised with a
//! deterministic fake as easily as with the built-in [`SimulatedFactory`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::metrics::Metric;

mod config;
mod simulated;

pub use config::{DEFAULT_MESSAGE, DEFAULT_NODE_ADDRESS, DEFAULT_TAG, NIRVANA_ADDRESS, PowMode, WorkloadConfig};
pub use simulated::{SimulatedFactory, SimulatedWorkload, SimulationSettings};

/// Errors reported across the workload boundary
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkloadError {
    #[error("Invalid workload configuration: {0}")]
    Config(String),

    #[error("Workload failed to start: {0}")]
    Start(String),

    #[error("Workload failed to stop: {0}")]
    ShutdownFailed(String),
}

/// Producer side of the metric pipe handed to each workload
pub type MetricSink = mpsc::Sender<Metric>;

/// A live, controllable workload instance
#[async_trait]
pub trait Workload: Send + Sync {
    /// Request execution to begin
    ///
    /// Returns once the transition is requested, without waiting for steady
    /// state. `is_running` must report `true` as soon as this returns `Ok`.
    async fn start(&self) -> Result<(), WorkloadError>;

    /// Request shutdown and wait until the workload has halted
    async fn stop(&self) -> Result<(), WorkloadError>;

    /// Cheap check of the workload's own running state
    fn is_running(&self) -> bool;
}

/// Builds workload instances from a configuration
pub trait WorkloadFactory: Send + Sync {
    /// Construct a stopped workload that emits its metrics into `metrics`
    fn configure(&self, config: &WorkloadConfig, metrics: MetricSink) -> Result<Arc<dyn Workload>, WorkloadError>;
}
