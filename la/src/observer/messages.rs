//! Observer envelopes
//!
//! Newline-delimited JSON. Every line is `{"msg_type": ..., "data": ..., "ts": ...}`
//! in both directions; observers send `start`, `stop` or `state` and receive
//! `state`, `metric` and `read_error` envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lifecycle::StatusSnapshot;
use crate::metrics::Metric;

/// Maximum size of one envelope line in bytes
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Envelope kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    /// The endpoint could not read the last line
    ReadError,
    Start,
    Stop,
    Metric,
    /// Status report; sent by an observer it simply asks for one
    State,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_type: MsgType,
    #[serde(default)]
    pub data: Value,
    pub ts: DateTime<Utc>,
}

impl Envelope {
    fn new(msg_type: MsgType, data: Value) -> Self {
        Self {
            msg_type,
            data,
            ts: Utc::now(),
        }
    }

    /// A data-less command envelope
    pub fn command(msg_type: MsgType) -> Self {
        Self::new(msg_type, Value::Null)
    }

    pub fn state(status: &StatusSnapshot) -> Self {
        Self::new(MsgType::State, serde_json::to_value(status).unwrap_or(Value::Null))
    }

    pub fn metric(metric: &Metric) -> Self {
        Self::new(MsgType::Metric, serde_json::to_value(metric).unwrap_or(Value::Null))
    }

    pub fn read_error(reason: impl Into<String>) -> Self {
        Self::new(MsgType::ReadError, Value::String(reason.into()))
    }

    /// Decode the status carried by a `state` envelope
    pub fn as_status(&self) -> Option<StatusSnapshot> {
        match self.msg_type {
            MsgType::State => serde_json::from_value(self.data.clone()).ok(),
            _ => None,
        }
    }

    /// Decode the metric carried by a `metric` envelope
    pub fn as_metric(&self) -> Option<Metric> {
        match self.msg_type {
            MsgType::Metric => serde_json::from_value(self.data.clone()).ok(),
            _ => None,
        }
    }

    /// Serialize as one line, newline included
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricKind;

    #[test]
    fn test_command_serialize() {
        let line = Envelope::command(MsgType::Start).to_line().unwrap();
        assert!(line.starts_with(r#"{"msg_type":"start","data":null,"ts":""#));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_command_deserialize_without_data() {
        let env = Envelope::from_line(r#"{"msg_type":"stop","ts":"2024-01-01T00:00:00Z"}"#).unwrap();
        assert_eq!(env.msg_type, MsgType::Stop);
        assert!(env.data.is_null());
    }

    #[test]
    fn test_state_carries_status() {
        let status = StatusSnapshot {
            config_hash: Some("0123".to_string()),
            running: true,
        };
        let env = Envelope::from_line(&Envelope::state(&status).to_line().unwrap()).unwrap();
        assert_eq!(env.as_status(), Some(status));
        assert_eq!(env.as_metric(), None);
    }

    #[test]
    fn test_metric_carries_metric() {
        let metric = Metric::counter(MetricKind::IncBadTrunk);
        let env = Envelope::metric(&metric);
        assert_eq!(env.msg_type, MsgType::Metric);
        assert_eq!(env.as_metric(), Some(metric));
    }

    #[test]
    fn test_read_error() {
        let env = Envelope::read_error("bad line");
        assert_eq!(env.msg_type, MsgType::ReadError);
        assert_eq!(env.data, Value::String("bad line".to_string()));
    }

    #[test]
    fn test_unknown_msg_type_rejected() {
        assert!(Envelope::from_line(r#"{"msg_type":"explode","ts":"2024-01-01T00:00:00Z"}"#).is_err());
    }
}
