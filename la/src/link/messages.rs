//! Coordinator protocol messages
//!
//! Every frame is a JSON text envelope `{"type": ..., "payload": ...}`. The
//! payload is omitted for messages that carry none.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::error::LinkError;
use crate::lifecycle::StatusSnapshot;
use crate::metrics::Metric;

/// Messages from the agent to the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Opening greeting carrying the agent's credential
    Hello { token: String },

    /// Current configuration fingerprint and running flag
    StatusReport(StatusSnapshot),

    /// A relayed workload metric
    Metric(Metric),

    /// The agent hit an error it cannot describe to the controller
    InternalError,

    /// The agent is going away
    Bye,
}

impl AgentMessage {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            AgentMessage::Hello { .. } => "hello",
            AgentMessage::StatusReport(_) => "status_report",
            AgentMessage::Metric(_) => "metric",
            AgentMessage::InternalError => "internal_error",
            AgentMessage::Bye => "bye",
        }
    }

    pub fn to_frame(&self) -> Result<String, LinkError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_frame(frame: &str) -> Result<Self, LinkError> {
        Ok(serde_json::from_str(frame)?)
    }
}

/// Messages from the controller to the agent
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerMessage {
    /// Handshake rejected
    TokenInvalid,
    /// Handshake accepted; carries the initial workload config
    Welcome(Value),
    Start,
    Stop,
    Restart,
    /// Replace the workload config
    ResetConfig(Value),
    /// Acknowledgement only
    Metrics,
    /// A type this agent does not understand
    Unknown(String),
}

/// Raw envelope as it appears on the wire
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
}

impl ControllerMessage {
    /// Wire name of the message type
    pub fn kind(&self) -> &str {
        match self {
            ControllerMessage::TokenInvalid => "token_invalid",
            ControllerMessage::Welcome(_) => "welcome",
            ControllerMessage::Start => "start",
            ControllerMessage::Stop => "stop",
            ControllerMessage::Restart => "restart",
            ControllerMessage::ResetConfig(_) => "reset_config",
            ControllerMessage::Metrics => "metrics",
            ControllerMessage::Unknown(kind) => kind,
        }
    }

    /// Decode a frame
    ///
    /// Unknown types decode to [`ControllerMessage::Unknown`]; a frame that is not
    /// an envelope at all is a protocol violation.
    pub fn from_frame(frame: &str) -> Result<Self, LinkError> {
        let envelope: Envelope =
            serde_json::from_str(frame).map_err(|e| LinkError::ProtocolViolation(format!("malformed frame: {}", e)))?;
        debug!(kind = %envelope.kind, "ControllerMessage::from_frame: decoded envelope");

        let msg = match envelope.kind.as_str() {
            "token_invalid" => ControllerMessage::TokenInvalid,
            "welcome" => ControllerMessage::Welcome(envelope.payload),
            "start" => ControllerMessage::Start,
            "stop" => ControllerMessage::Stop,
            "restart" => ControllerMessage::Restart,
            "reset_config" => ControllerMessage::ResetConfig(envelope.payload),
            "metrics" => ControllerMessage::Metrics,
            _ => ControllerMessage::Unknown(envelope.kind),
        };
        Ok(msg)
    }

    /// Encode as a frame (used by controllers and test peers)
    pub fn to_frame(&self) -> Result<String, LinkError> {
        let payload = match self {
            ControllerMessage::Welcome(payload) | ControllerMessage::ResetConfig(payload) => payload.clone(),
            _ => Value::Null,
        };
        let envelope = Envelope {
            kind: self.kind().to_string(),
            payload,
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}
