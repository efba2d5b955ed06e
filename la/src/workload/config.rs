//! WorkloadConfig - declarative description of a workload run
//!
//! A config is immutable once installed; reconfiguration replaces it wholesale.
//! Its fingerprint lets observers detect drift without receiving the full config.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::WorkloadError;

/// Destination address that burns transactions (81 trytes of nines)
pub const NIRVANA_ADDRESS: &str =
    "999999999999999999999999999999999999999999999999999999999999999999999999999999999";

/// Default transaction tag
pub const DEFAULT_TAG: &str = "999SPAMALOT";

/// Default transaction message
pub const DEFAULT_MESSAGE: &str = "GOSPAMMER9SPAMALOT";

/// Default node endpoint
pub const DEFAULT_NODE_ADDRESS: &str = "http://nodes.iota.fm:80";

/// Number of bytes of the SHA-256 digest kept in a fingerprint (128 bits)
const FINGERPRINT_BYTES: usize = 16;

/// Where proof-of-work is performed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowMode {
    /// Compute proof-of-work on this machine
    #[default]
    Local,
    /// Delegate proof-of-work to the node
    Remote,
}

/// Workload configuration as distributed by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// Address the generated transactions are sent to
    pub dest_address: String,

    /// Minimum weight magnitude (proof-of-work difficulty)
    pub mwm: u64,

    /// Tip selection depth
    pub depth: u64,

    #[serde(default)]
    pub tag: String,

    #[serde(default)]
    pub message: String,

    /// Signature security level (1-3)
    pub security_lvl: u8,

    #[serde(default)]
    pub filter_trunk: bool,

    #[serde(default)]
    pub filter_branch: bool,

    #[serde(default)]
    pub filter_milestone: bool,

    /// Node API endpoint
    pub node_address: String,

    #[serde(default)]
    pub pow_mode: PowMode,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            dest_address: NIRVANA_ADDRESS.to_string(),
            mwm: 14,
            depth: 3,
            tag: DEFAULT_TAG.to_string(),
            message: DEFAULT_MESSAGE.to_string(),
            security_lvl: 2,
            filter_trunk: false,
            filter_branch: false,
            filter_milestone: false,
            node_address: DEFAULT_NODE_ADDRESS.to_string(),
            pow_mode: PowMode::Local,
        }
    }
}

impl WorkloadConfig {
    /// Parse and validate a config from a protocol payload
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, WorkloadError> {
        debug!("WorkloadConfig::from_payload: called");
        let config: Self =
            serde_json::from_value(payload.clone()).map_err(|e| WorkloadError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check field ranges the workload relies on
    pub fn validate(&self) -> Result<(), WorkloadError> {
        if self.mwm == 0 {
            return Err(WorkloadError::Config("mwm must be greater than zero".to_string()));
        }
        if self.depth == 0 {
            return Err(WorkloadError::Config("depth must be greater than zero".to_string()));
        }
        if !(1..=3).contains(&self.security_lvl) {
            return Err(WorkloadError::Config(format!(
                "security level must be 1, 2 or 3, got {}",
                self.security_lvl
            )));
        }
        if self.node_address.trim().is_empty() {
            return Err(WorkloadError::Config("node address must not be empty".to_string()));
        }
        Ok(())
    }

    /// Canonical serialization used for fingerprinting
    fn canonical_bytes(&self) -> Vec<u8> {
        // Struct serialization is field-ordered and contains no maps
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// 128-bit content hash of the canonical serialization, hex encoded
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.canonical_bytes());
        hex::encode(&digest[..FINGERPRINT_BYTES])
    }

    /// Human-readable rendering for logs
    pub fn pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}
