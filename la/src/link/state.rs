//! Link state machine
//!
//! ```text
//! Disconnected -> Dialing -> HandshakeSent -> Rejected ----------------> Closed
//!                    |              |
//!                    |              +-------> Welcomed -> Communicating -> Closed
//!                    +------------------------------------------------> Closed
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use super::messages::ControllerMessage;
use crate::workload::WorkloadConfig;

/// Why a link reached `Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The transport could not be opened
    DialFailed,
    /// The controller refused our token
    Rejected,
    /// Unexpected message type or ordering from the controller
    ProtocolViolation,
    /// The welcome payload did not parse
    InvalidConfig,
    /// The initial workload handle could not be built
    WorkloadInitFailed,
    /// The connection went away on its own
    TransportClosed,
    /// Local shutdown was requested
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::DialFailed => "dial failed",
            CloseReason::Rejected => "token rejected",
            CloseReason::ProtocolViolation => "protocol violation",
            CloseReason::InvalidConfig => "invalid configuration",
            CloseReason::WorkloadInitFailed => "workload initialisation failed",
            CloseReason::TransportClosed => "transport closed",
            CloseReason::Shutdown => "shutdown",
        };
        write!(f, "{}", s)
    }
}

/// Where a coordinator link currently is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Dialing,
    HandshakeSent,
    Rejected,
    /// Accepted with a configuration whose fingerprint is carried along
    Welcomed { fingerprint: String },
    Communicating,
    Closed(CloseReason),
}

impl LinkState {
    pub fn is_closed(&self) -> bool {
        matches!(self, LinkState::Closed(_))
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn allows(&self, next: &LinkState) -> bool {
        use LinkState::*;
        match (self, next) {
            (Disconnected, Dialing) => true,
            (Dialing, HandshakeSent) => true,
            (HandshakeSent, Rejected) | (HandshakeSent, Welcomed { .. }) => true,
            (Welcomed { .. }, Communicating) => true,
            (Closed(_), _) => false,
            (_, Closed(_)) => !matches!(self, Disconnected),
            _ => false,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Dialing => write!(f, "dialing"),
            LinkState::HandshakeSent => write!(f, "handshake-sent"),
            LinkState::Rejected => write!(f, "rejected"),
            LinkState::Welcomed { fingerprint } => write!(f, "welcomed ({})", fingerprint),
            LinkState::Communicating => write!(f, "communicating"),
            LinkState::Closed(reason) => write!(f, "closed: {}", reason),
        }
    }
}

/// What the single handshake reply means for the link
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeOutcome {
    Rejected,
    Welcomed(WorkloadConfig),
    /// A welcome whose payload is not a usable configuration
    InvalidConfig(String),
    /// Anything other than a welcome or a rejection
    ProtocolViolation(String),
}

impl HandshakeOutcome {
    /// The state the link enters after this reply
    pub fn next_state(&self) -> LinkState {
        match self {
            HandshakeOutcome::Rejected => LinkState::Rejected,
            HandshakeOutcome::Welcomed(config) => LinkState::Welcomed {
                fingerprint: config.fingerprint(),
            },
            HandshakeOutcome::InvalidConfig(_) => LinkState::Closed(CloseReason::InvalidConfig),
            HandshakeOutcome::ProtocolViolation(_) => LinkState::Closed(CloseReason::ProtocolViolation),
        }
    }
}

/// Classify the reply to our hello
pub fn on_handshake_reply(reply: &ControllerMessage) -> HandshakeOutcome {
    match reply {
        ControllerMessage::TokenInvalid => HandshakeOutcome::Rejected,
        ControllerMessage::Welcome(payload) => match WorkloadConfig::from_payload(payload) {
            Ok(config) => HandshakeOutcome::Welcomed(config),
            Err(e) => HandshakeOutcome::InvalidConfig(e.to_string()),
        },
        other => HandshakeOutcome::ProtocolViolation(format!("expected welcome, got {}", other.kind())),
    }
}
