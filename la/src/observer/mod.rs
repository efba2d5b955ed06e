//! Local observer endpoint
//!
//! A Unix Domain Socket that exposes the workload's start/stop controls and
//! live metric stream to any number of local observers.

use std::path::PathBuf;

pub mod client;
pub mod listener;
pub mod messages;

pub use client::ObserverClient;
pub use listener::{ObserverEndpoint, cleanup_socket, create_listener, create_listener_at};
pub use messages::{Envelope, MsgType};

/// Default socket path for the observer endpoint
pub fn get_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("loadagent")
        .join("observer.sock")
}
