//! loadagent - remote-controlled workload agent
//!
//! The agent holds one long-lived session with a controller, receives a
//! workload configuration, and then runs start/stop/restart/reconfigure
//! commands against a managed workload while reporting its state and streaming
//! metrics back. The same controls and metric stream are offered to any number
//! of local observers over a Unix socket.
//!
//! # Modules
//!
//! - [`metrics`] - Metric types and the fan-out broker
//! - [`workload`] - Workload capability traits, config and fingerprint, simulated workload
//! - [`lifecycle`] - Serialized control of the workload handle
//! - [`link`] - Coordinator protocol, transports and the session state machine
//! - [`observer`] - Local observer endpoint and client
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod lifecycle;
pub mod link;
pub mod metrics;
pub mod observer;
pub mod workload;

// Re-export commonly used types
pub use config::{AgentConfig, BrokerConfig, CoordinatorConfig, ObserverConfig};
pub use lifecycle::{ControlError, LifecycleController, ResetPolicy, StatusSnapshot};
pub use link::{
    AgentMessage, ChannelDialer, CloseReason, ControllerMessage, CoordinatorLink, Dialer, LinkError, LinkSettings,
    LinkState, WebSocketDialer,
};
pub use metrics::{Metric, MetricBroker, MetricKind, Summary};
pub use observer::{ObserverClient, ObserverEndpoint};
pub use workload::{
    MetricSink, SimulatedFactory, SimulationSettings, Workload, WorkloadConfig, WorkloadError, WorkloadFactory,
};
