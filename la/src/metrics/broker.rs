//! Metric Broker - fan-out of workload metrics with slow-consumer eviction
//!
//! A single producer publishes metrics; every registered subscriber gets its own
//! bounded delivery channel. A subscriber that does not accept a metric within the
//! delivery timeout is unregistered and its channel closed, so the producer is
//! never stalled by one slow or dead consumer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::Metric;

/// Per-subscriber hand-off timeout
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-subscriber delivery channel capacity
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 16;

/// Identifier handed out on subscribe; never reused within a broker's lifetime
pub type SubscriberId = u64;

struct Registry {
    next_id: SubscriberId,
    subscribers: BTreeMap<SubscriberId, mpsc::Sender<Metric>>,
}

/// Multi-consumer metric broker
///
/// One lock guards the subscriber set. Subscribe, unsubscribe and the delivery
/// pass all take it, so a subscriber is never delivered to after it has left.
pub struct MetricBroker {
    registry: Mutex<Registry>,
    delivery_timeout: Duration,
    subscriber_buffer: usize,
}

impl MetricBroker {
    /// Create a broker with the given delivery timeout and per-subscriber buffer
    pub fn new(delivery_timeout: Duration, subscriber_buffer: usize) -> Self {
        debug!(?delivery_timeout, subscriber_buffer, "MetricBroker::new: called");
        Self {
            registry: Mutex::new(Registry {
                next_id: 0,
                subscribers: BTreeMap::new(),
            }),
            delivery_timeout,
            subscriber_buffer: subscriber_buffer.max(1),
        }
    }

    /// Create a broker with the default one second timeout
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_DELIVERY_TIMEOUT, DEFAULT_SUBSCRIBER_BUFFER)
    }

    /// The configured hand-off timeout
    pub fn delivery_timeout(&self) -> Duration {
        self.delivery_timeout
    }

    /// Register a new consumer
    ///
    /// The returned receiver yields every metric published after this call. It
    /// returns `None` once the subscriber is evicted.
    pub async fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<Metric>) {
        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let mut registry = self.registry.lock().await;
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscribers.insert(id, tx);
        debug!(id, subscribers = registry.subscribers.len(), "MetricBroker::subscribe: registered");
        (id, rx)
    }

    /// Remove a consumer; no-op if it is already gone
    pub async fn unsubscribe(&self, id: SubscriberId) {
        let mut registry = self.registry.lock().await;
        if registry.subscribers.remove(&id).is_some() {
            debug!(id, subscribers = registry.subscribers.len(), "MetricBroker::unsubscribe: removed");
        } else {
            debug!(id, "MetricBroker::unsubscribe: already removed");
        }
    }

    /// Number of currently registered consumers
    pub async fn subscriber_count(&self) -> usize {
        self.registry.lock().await.subscribers.len()
    }

    /// Deliver a metric to every registered consumer
    ///
    /// Each hand-off is bounded by the delivery timeout. Consumers that time out,
    /// or whose receiver is already dropped, are unregistered; dropping the
    /// broker's sender closes their channel. Returns the evicted ids.
    pub async fn publish(&self, metric: Metric) -> Vec<SubscriberId> {
        let mut registry = self.registry.lock().await;
        let mut evicted = Vec::new();

        for (id, tx) in registry.subscribers.iter() {
            match tx.send_timeout(metric.clone(), self.delivery_timeout).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(
                        id,
                        timeout_ms = self.delivery_timeout.as_millis() as u64,
                        "MetricBroker::publish: subscriber too slow, evicting"
                    );
                    evicted.push(*id);
                }
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(id, "MetricBroker::publish: subscriber receiver dropped, removing");
                    evicted.push(*id);
                }
            }
        }

        for id in &evicted {
            registry.subscribers.remove(id);
        }

        evicted
    }
}

impl Default for MetricBroker {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Republish everything the producer pipe yields through the broker
///
/// Runs until every producer sender is dropped.
pub fn spawn_metric_relay(broker: Arc<MetricBroker>, mut rx: mpsc::Receiver<Metric>) -> JoinHandle<()> {
    debug!("spawn_metric_relay: called");
    tokio::spawn(async move {
        while let Some(metric) = rx.recv().await {
            let evicted = broker.publish(metric).await;
            if !evicted.is_empty() {
                info!(?evicted, "metric relay: evicted subscribers");
            }
        }
        debug!("metric relay: producer pipe closed");
    })
}
