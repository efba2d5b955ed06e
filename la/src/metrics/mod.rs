//! Workload metrics and their fan-out
//!
//! Workloads emit [`Metric`] events into a single producer pipe. The
//! [`MetricBroker`] republishes each one to every registered consumer (the
//! coordinator link and each local observer), evicting consumers that fall
//! behind instead of buffering without bound.
//!
//! ```text
//!   workload ──> producer pipe ──> relay ──> MetricBroker ──┬──> coordinator link
//!                                                           ├──> observer #1
//!                                                           └──> observer #N
//! ```

mod broker;
mod types;

pub use broker::{
    DEFAULT_DELIVERY_TIMEOUT, DEFAULT_SUBSCRIBER_BUFFER, MetricBroker, SubscriberId, spawn_metric_relay,
};
pub use types::{Metric, MetricKind, Summary};
