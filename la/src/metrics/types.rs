//! Metric types emitted by workloads
//!
//! A metric is an immutable, timestamped event. Counter kinds carry no data,
//! the summary kind carries an aggregate [`Summary`] snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The vocabulary of workload metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    IncMilestoneBranch,
    IncMilestoneTrunk,
    IncBadTrunk,
    IncBadBranch,
    IncBadTrunkAndBranch,
    IncFailedTx,
    IncSuccessfulTx,
    Summary,
}

impl MetricKind {
    /// Whether this kind is forwarded to the coordinator
    ///
    /// The coordinator only aggregates summaries and success counters; the
    /// remaining kinds stay local.
    pub fn is_relayed_upstream(&self) -> bool {
        matches!(self, MetricKind::Summary | MetricKind::IncSuccessfulTx)
    }
}

/// Aggregate counters reported by the summary metric
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub txs_succeeded: u64,
    pub txs_failed: u64,
    pub bad_trunk: u64,
    pub bad_branch: u64,
    pub bad_trunk_and_branch: u64,
    pub milestone_trunk: u64,
    pub milestone_branch: u64,
    /// Successful transactions per second over the summary window
    pub tps: f64,
    /// Failed / attempted over the lifetime of the run
    pub error_rate: f64,
}

/// A single event produced by a workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    pub kind: MetricKind,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl Metric {
    /// Create a metric of the given kind with no payload
    pub fn counter(kind: MetricKind) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            kind,
            data: serde_json::Value::Null,
            ts: Utc::now(),
        }
    }

    /// Create a summary metric
    pub fn summary(summary: &Summary) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            kind: MetricKind::Summary,
            data: serde_json::to_value(summary).unwrap_or(serde_json::Value::Null),
            ts: Utc::now(),
        }
    }
}
