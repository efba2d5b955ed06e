//! Simulated workload - a stand-in transaction generator
//!
//! Emits the same metric vocabulary a real transaction generator would (per-transaction
//! counters and periodic summaries) at configurable rates, so the agent can be
//! run and observed end to end without a proof-of-work engine.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{MetricSink, Workload, WorkloadConfig, WorkloadError, WorkloadFactory};
use crate::metrics::{Metric, MetricKind, Summary};

/// Probability that a selected trunk or branch tip is unusable
const BAD_TIP_RATE: f64 = 0.02;

/// Probability that a selected tip is a milestone
const MILESTONE_RATE: f64 = 0.05;

/// Rates for the simulated transaction stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Summary period in milliseconds
    #[serde(rename = "tick-ms")]
    pub tick_ms: u64,

    /// Delay between simulated transactions in milliseconds
    #[serde(rename = "tx-interval-ms")]
    pub tx_interval_ms: u64,

    /// Fraction of transactions that fail
    #[serde(rename = "failure-rate")]
    pub failure_rate: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            tx_interval_ms: 250,
            failure_rate: 0.05,
        }
    }
}

impl SimulationSettings {
    fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    fn tx_interval(&self) -> Duration {
        Duration::from_millis(self.tx_interval_ms.max(1))
    }
}

/// Factory for [`SimulatedWorkload`]
#[derive(Debug, Clone, Default)]
pub struct SimulatedFactory {
    settings: SimulationSettings,
}

impl SimulatedFactory {
    pub fn new(settings: SimulationSettings) -> Self {
        Self { settings }
    }
}

impl WorkloadFactory for SimulatedFactory {
    fn configure(&self, config: &WorkloadConfig, metrics: MetricSink) -> Result<Arc<dyn Workload>, WorkloadError> {
        debug!(mwm = config.mwm, node = %config.node_address, "SimulatedFactory::configure: called");
        config.validate()?;
        if !(0.0..=1.0).contains(&self.settings.failure_rate) {
            return Err(WorkloadError::Config(format!(
                "failure rate must be within 0.0..=1.0, got {}",
                self.settings.failure_rate
            )));
        }
        Ok(Arc::new(SimulatedWorkload::new(
            config.clone(),
            self.settings.clone(),
            metrics,
        )))
    }
}

struct Running {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// A workload that fabricates transaction outcomes
pub struct SimulatedWorkload {
    config: WorkloadConfig,
    settings: SimulationSettings,
    metrics: MetricSink,
    running: Mutex<Option<Running>>,
}

impl SimulatedWorkload {
    pub fn new(config: WorkloadConfig, settings: SimulationSettings, metrics: MetricSink) -> Self {
        Self {
            config,
            settings,
            metrics,
            running: Mutex::new(None),
        }
    }

    /// The configuration this instance was built from
    pub fn config(&self) -> &WorkloadConfig {
        &self.config
    }
}

#[async_trait]
impl Workload for SimulatedWorkload {
    async fn start(&self) -> Result<(), WorkloadError> {
        let mut slot = self
            .running
            .lock()
            .map_err(|_| WorkloadError::Start("workload state poisoned".to_string()))?;
        if let Some(running) = slot.as_ref()
            && !running.handle.is_finished()
        {
            debug!("SimulatedWorkload::start: already running");
            return Ok(());
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run_simulation(
            self.config.clone(),
            self.settings.clone(),
            self.metrics.clone(),
            stop_rx,
        ));
        *slot = Some(Running { stop_tx, handle });
        info!(tag = %self.config.tag, "simulated workload started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), WorkloadError> {
        let running = self
            .running
            .lock()
            .map_err(|_| WorkloadError::ShutdownFailed("workload state poisoned".to_string()))?
            .take();

        let Some(running) = running else {
            debug!("SimulatedWorkload::stop: not running");
            return Ok(());
        };

        // The task may already have exited on its own
        let _ = running.stop_tx.send(());
        running
            .handle
            .await
            .map_err(|e| WorkloadError::ShutdownFailed(e.to_string()))?;
        info!("simulated workload stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false)
    }
}

/// Outcome of one simulated transaction attempt
fn simulate_attempt(config: &WorkloadConfig, failure_rate: f64) -> Vec<MetricKind> {
    let mut kinds = Vec::new();

    let bad_trunk = rand::random::<f64>() < BAD_TIP_RATE;
    let bad_branch = rand::random::<f64>() < BAD_TIP_RATE;
    match (bad_trunk, bad_branch) {
        (true, true) => kinds.push(MetricKind::IncBadTrunkAndBranch),
        (true, false) => kinds.push(MetricKind::IncBadTrunk),
        (false, true) => kinds.push(MetricKind::IncBadBranch),
        (false, false) => {}
    }
    if (bad_trunk && config.filter_trunk) || (bad_branch && config.filter_branch) {
        // Filtered tips are dropped before proof-of-work
        return kinds;
    }

    if !config.filter_milestone {
        if rand::random::<f64>() < MILESTONE_RATE {
            kinds.push(MetricKind::IncMilestoneTrunk);
        }
        if rand::random::<f64>() < MILESTONE_RATE {
            kinds.push(MetricKind::IncMilestoneBranch);
        }
    }

    if rand::random::<f64>() < failure_rate {
        kinds.push(MetricKind::IncFailedTx);
    } else {
        kinds.push(MetricKind::IncSuccessfulTx);
    }
    kinds
}

fn record(summary: &mut Summary, kind: MetricKind) {
    match kind {
        MetricKind::IncMilestoneBranch => summary.milestone_branch += 1,
        MetricKind::IncMilestoneTrunk => summary.milestone_trunk += 1,
        MetricKind::IncBadTrunk => summary.bad_trunk += 1,
        MetricKind::IncBadBranch => summary.bad_branch += 1,
        MetricKind::IncBadTrunkAndBranch => summary.bad_trunk_and_branch += 1,
        MetricKind::IncFailedTx => summary.txs_failed += 1,
        MetricKind::IncSuccessfulTx => summary.txs_succeeded += 1,
        MetricKind::Summary => {}
    }
}

/// Push one metric, giving up if a stop arrives while the pipe is full
///
/// Returns `false` when the simulation should halt.
async fn deliver(metrics: &MetricSink, metric: Metric, stop_rx: &mut oneshot::Receiver<()>) -> bool {
    tokio::select! {
        biased;
        _ = stop_rx => {
            debug!("run_simulation: stop requested while metric pipe was full");
            false
        }
        sent = metrics.send(metric) => {
            if sent.is_err() {
                warn!("run_simulation: metric pipe closed, halting");
            }
            sent.is_ok()
        }
    }
}

async fn run_simulation(
    config: WorkloadConfig,
    settings: SimulationSettings,
    metrics: MetricSink,
    mut stop_rx: oneshot::Receiver<()>,
) {
    debug!(?settings, "run_simulation: called");
    let mut tx_interval = tokio::time::interval(settings.tx_interval());
    let mut tick = tokio::time::interval(settings.tick());
    // The first tick of a tokio interval fires immediately
    tick.tick().await;

    let mut totals = Summary::default();
    let mut window_start = Instant::now();
    let mut window_succeeded = 0u64;

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                debug!("run_simulation: stop requested");
                break;
            }
            _ = tx_interval.tick() => {
                for kind in simulate_attempt(&config, settings.failure_rate) {
                    record(&mut totals, kind);
                    if kind == MetricKind::IncSuccessfulTx {
                        window_succeeded += 1;
                    }
                    if !deliver(&metrics, Metric::counter(kind), &mut stop_rx).await {
                        return;
                    }
                }
            }
            _ = tick.tick() => {
                let elapsed = window_start.elapsed().as_secs_f64();
                totals.tps = if elapsed > 0.0 { window_succeeded as f64 / elapsed } else { 0.0 };
                let attempted = totals.txs_succeeded + totals.txs_failed;
                totals.error_rate = if attempted > 0 { totals.txs_failed as f64 / attempted as f64 } else { 0.0 };
                window_start = Instant::now();
                window_succeeded = 0;

                if !deliver(&metrics, Metric::summary(&totals), &mut stop_rx).await {
                    return;
                }
            }
        }
    }
}
