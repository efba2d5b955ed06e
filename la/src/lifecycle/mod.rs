//! Lifecycle control of the managed workload
//!
//! [`LifecycleController`] owns the single live workload handle and serializes
//! start, stop, restart and reconfiguration behind one lock. Status is derived
//! from the handle on demand and never cached.

mod controller;
mod error;

pub use controller::{LifecycleController, ResetPolicy, StatusSnapshot};
pub use error::ControlError;
