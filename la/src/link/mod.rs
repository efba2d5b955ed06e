//! Coordinator link - the agent's single session with its controller
//!
//! A [`CoordinatorLink`] dials the controller through a [`Dialer`], sends a
//! hello, waits for exactly one reply, and on welcome enters a command loop
//! that drives the [`LifecycleController`](crate::lifecycle::LifecycleController).
//! The transport is owned by one reader task and one writer task; everything
//! else talks to it through queues.

mod connection;
mod error;
mod messages;
mod session;
mod state;
mod transport;

pub use connection::{Connection, ConnectionSender};
pub use error::LinkError;
pub use messages::{AgentMessage, ControllerMessage};
pub use session::{CoordinatorLink, LinkSettings};
pub use state::{CloseReason, HandshakeOutcome, LinkState, on_handshake_reply};
pub use transport::{ChannelDialer, Dialer, FrameSink, FrameStream, PeerEnd, Transport, WebSocketDialer};
