//! LifecycleController - serialized control of the workload handle

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use super::error::ControlError;
use crate::metrics::{MetricBroker, spawn_metric_relay};
use crate::workload::{MetricSink, Workload, WorkloadConfig, WorkloadFactory};

/// Point-in-time view of the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Fingerprint of the installed configuration, absent before the first one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    pub running: bool,
}

/// Whether a configuration reset resumes the workload afterwards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResetPolicy {
    /// Start again only if the workload was running before the reset
    #[default]
    PreviousState,
    /// Always start the workload after a reset
    AlwaysStart,
}

/// The installed workload together with the config it was built from
struct Installed {
    config: WorkloadConfig,
    workload: Arc<dyn Workload>,
}

/// Owner of the single live workload handle
///
/// Every mutating operation takes `ops` for its whole duration, so commands are
/// applied strictly one at a time. The installed handle sits behind a separate
/// short-lived lock so [`status`](Self::status) never waits on a command.
pub struct LifecycleController {
    factory: Arc<dyn WorkloadFactory>,
    metrics_tx: MetricSink,
    ops: Mutex<()>,
    installed: RwLock<Option<Arc<Installed>>>,
}

impl LifecycleController {
    /// Create a controller whose workloads publish through `broker`
    ///
    /// Spawns the relay task that drains the producer pipe into the broker.
    pub fn spawn(factory: Arc<dyn WorkloadFactory>, broker: Arc<MetricBroker>, producer_buffer: usize) -> Self {
        debug!(producer_buffer, "LifecycleController::spawn: called");
        let (metrics_tx, metrics_rx) = mpsc::channel(producer_buffer.max(1));
        spawn_metric_relay(broker, metrics_rx);
        Self {
            factory,
            metrics_tx,
            ops: Mutex::new(()),
            installed: RwLock::new(None),
        }
    }

    fn current(&self) -> Option<Arc<Installed>> {
        self.installed.read().ok().and_then(|guard| guard.clone())
    }

    /// Whether a workload handle exists
    pub fn is_initialised(&self) -> bool {
        self.current().is_some()
    }

    /// The currently installed configuration
    pub fn current_config(&self) -> Option<WorkloadConfig> {
        self.current().map(|installed| installed.config.clone())
    }

    /// Current status, computed from the workload's own running state
    pub fn status(&self) -> StatusSnapshot {
        match self.current() {
            Some(installed) => StatusSnapshot {
                config_hash: Some(installed.config.fingerprint()),
                running: installed.workload.is_running(),
            },
            None => StatusSnapshot {
                config_hash: None,
                running: false,
            },
        }
    }

    /// Start the workload; no-op if it is already running
    pub async fn start(&self) -> Result<(), ControlError> {
        debug!("LifecycleController::start: called");
        let _guard = self.ops.lock().await;
        self.start_locked().await
    }

    /// Stop the workload and wait for it to halt; no-op if already stopped
    pub async fn stop(&self) -> Result<(), ControlError> {
        debug!("LifecycleController::stop: called");
        let _guard = self.ops.lock().await;
        self.stop_locked().await
    }

    /// Stop followed by start; a failed stop skips the start
    pub async fn restart(&self) -> Result<(), ControlError> {
        debug!("LifecycleController::restart: called");
        let _guard = self.ops.lock().await;
        info!("restarting workload");
        self.stop_locked().await?;
        self.start_locked().await
    }

    /// Build a workload from `config` and swap it in
    ///
    /// Does not stop the previous handle; callers stop it first.
    pub async fn reconfigure(&self, config: WorkloadConfig) -> Result<(), ControlError> {
        debug!("LifecycleController::reconfigure: called");
        let _guard = self.ops.lock().await;
        self.install_locked(config)
    }

    /// Replace the configuration from a raw payload
    ///
    /// The payload is validated before anything is touched, so a malformed one
    /// leaves the controller exactly as it was. A valid one stops the current
    /// handle, installs the new config, and resumes according to `policy`.
    pub async fn reset_config(&self, payload: &serde_json::Value, policy: ResetPolicy) -> Result<(), ControlError> {
        debug!(?policy, "LifecycleController::reset_config: called");
        let config = WorkloadConfig::from_payload(payload)?;

        let _guard = self.ops.lock().await;
        let was_running = self.current().is_some_and(|installed| installed.workload.is_running());
        if self.current().is_some() {
            self.stop_locked().await?;
        }
        self.install_locked(config)?;

        let resume = match policy {
            ResetPolicy::PreviousState => was_running,
            ResetPolicy::AlwaysStart => true,
        };
        if resume {
            self.start_locked().await?;
        }
        info!(was_running, resumed = resume, "workload configuration reset");
        Ok(())
    }

    async fn start_locked(&self) -> Result<(), ControlError> {
        let installed = self.current().ok_or_else(|| {
            warn!("start requested but workload is not initialised");
            ControlError::NotInitialised
        })?;
        if installed.workload.is_running() {
            debug!("LifecycleController::start_locked: already running");
            return Ok(());
        }

        info!("starting workload");
        installed.workload.start().await?;
        info!("workload started");
        Ok(())
    }

    async fn stop_locked(&self) -> Result<(), ControlError> {
        let installed = self.current().ok_or_else(|| {
            warn!("stop requested but workload is not initialised");
            ControlError::NotInitialised
        })?;
        if !installed.workload.is_running() {
            debug!("LifecycleController::stop_locked: already stopped");
            return Ok(());
        }

        info!("halting workload");
        installed.workload.stop().await.map_err(|e| {
            warn!(error = %e, "workload failed to stop");
            ControlError::from(e)
        })?;
        info!("workload stopped");
        Ok(())
    }

    fn install_locked(&self, config: WorkloadConfig) -> Result<(), ControlError> {
        if self.current().is_some_and(|installed| installed.workload.is_running()) {
            warn!("replacing a workload handle that is still running");
        }

        let workload = self.factory.configure(&config, self.metrics_tx.clone())?;
        info!(fingerprint = %config.fingerprint(), "workload configuration installed:\n{}", config.pretty());

        let mut slot = self
            .installed
            .write()
            .map_err(|_| ControlError::Workload("installed handle lock poisoned".to_string()))?;
        *slot = Some(Arc::new(Installed { config, workload }));
        Ok(())
    }
}
