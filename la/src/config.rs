//! Agent configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::lifecycle::ResetPolicy;
use crate::metrics::{DEFAULT_DELIVERY_TIMEOUT, DEFAULT_SUBSCRIBER_BUFFER};
use crate::workload::{SimulationSettings, WorkloadConfig};

/// Main agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Controller connection
    pub coordinator: CoordinatorConfig,

    /// Metric fan-out
    pub broker: BrokerConfig,

    /// Local observer socket
    pub observer: ObserverConfig,

    /// Workload used by `serve` when no controller hands one out
    pub workload: WorkloadConfig,

    /// Built-in simulated workload
    pub simulation: SimulationSettings,
}

impl AgentConfig {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local: .loadagent.yml
        let local_config = PathBuf::from(".loadagent.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User: ~/.config/loadagent/loadagent.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("loadagent").join("loadagent.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read just the log level, before logging is set up
    ///
    /// Errors are swallowed; a broken config file is reported by [`load`](Self::load).
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates: Vec<PathBuf> = match config_path {
            Some(path) => vec![path.clone()],
            None => {
                let mut paths = vec![PathBuf::from(".loadagent.yml")];
                if let Some(config_dir) = dirs::config_dir() {
                    paths.push(config_dir.join("loadagent").join("loadagent.yml"));
                }
                paths
            }
        };

        candidates
            .iter()
            .filter(|path| path.exists())
            .find_map(|path| Self::load_from_file(path).ok())
            .and_then(|config| config.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Controller connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// host:port of the controller
    pub address: String,

    /// Literal API token; takes precedence over `token-env`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Environment variable holding the API token
    #[serde(rename = "token-env")]
    pub token_env: String,

    /// Websocket path on the controller
    pub path: String,

    #[serde(rename = "dial-timeout-ms")]
    pub dial_timeout_ms: u64,

    #[serde(rename = "outbound-buffer")]
    pub outbound_buffer: usize,

    #[serde(rename = "inbound-buffer")]
    pub inbound_buffer: usize,

    /// Whether a config reset resumes the workload
    #[serde(rename = "reset-policy")]
    pub reset_policy: ResetPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9090".to_string(),
            token: None,
            token_env: "LOADAGENT_TOKEN".to_string(),
            path: "/api".to_string(),
            dial_timeout_ms: 10_000,
            outbound_buffer: 64,
            inbound_buffer: 64,
            reset_policy: ResetPolicy::PreviousState,
        }
    }
}

impl CoordinatorConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Token from config, else from the configured environment variable
    pub fn resolve_token(&self) -> Result<String> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        std::env::var(&self.token_env).map_err(|_| {
            eyre::eyre!(
                "API token not found. Set coordinator.token or the {} environment variable.",
                self.token_env
            )
        })
    }
}

/// Metric broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// How long one subscriber may hold up delivery before eviction
    #[serde(rename = "delivery-timeout-ms")]
    pub delivery_timeout_ms: u64,

    #[serde(rename = "subscriber-buffer")]
    pub subscriber_buffer: usize,

    /// Capacity of the workload-to-broker pipe
    #[serde(rename = "producer-buffer")]
    pub producer_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT.as_millis() as u64,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            producer_buffer: 256,
        }
    }
}

impl BrokerConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Local observer socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub enabled: bool,

    /// Overrides the default socket location
    #[serde(rename = "socket-path", skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: None,
        }
    }
}

impl ObserverConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(crate::observer::get_socket_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();

        assert_eq!(config.coordinator.address, "127.0.0.1:9090");
        assert_eq!(config.coordinator.path, "/api");
        assert_eq!(config.coordinator.reset_policy, ResetPolicy::PreviousState);
        assert_eq!(config.broker.delivery_timeout(), Duration::from_secs(1));
        assert_eq!(config.broker.subscriber_buffer, 16);
        assert!(config.observer.enabled);
        assert_eq!(config.workload, WorkloadConfig::default());
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
log-level: debug

coordinator:
  address: coo.example:8080
  token: abc
  path: /ws
  dial-timeout-ms: 2500
  reset-policy: always-start

broker:
  delivery-timeout-ms: 500
  subscriber-buffer: 4

observer:
  enabled: false
  socket-path: /tmp/la.sock

workload:
  dest_address: ABCDEF
  mwm: 9
  depth: 2
  security_lvl: 1
  node_address: http://localhost:14265

simulation:
  tick-ms: 500
  failure-rate: 0.5
"#;

        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.coordinator.address, "coo.example:8080");
        assert_eq!(config.coordinator.token.as_deref(), Some("abc"));
        assert_eq!(config.coordinator.dial_timeout(), Duration::from_millis(2500));
        assert_eq!(config.coordinator.reset_policy, ResetPolicy::AlwaysStart);
        assert_eq!(config.broker.delivery_timeout_ms, 500);
        assert_eq!(config.broker.producer_buffer, 256);
        assert!(!config.observer.enabled);
        assert_eq!(config.observer.socket_path(), PathBuf::from("/tmp/la.sock"));
        assert_eq!(config.workload.mwm, 9);
        assert_eq!(config.workload.dest_address, "ABCDEF");
        assert_eq!(config.simulation.tick_ms, 500);
        assert_eq!(config.simulation.tx_interval_ms, 250);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
coordinator:
  address: 10.0.0.1:9090
"#;

        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.coordinator.address, "10.0.0.1:9090");
        assert_eq!(config.coordinator.token_env, "LOADAGENT_TOKEN");
        assert_eq!(config.coordinator.outbound_buffer, 64);
        assert!(config.observer.enabled);
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("agent.yml");
        std::fs::write(&path, "log-level: TRACE\ncoordinator:\n  address: a:1\n").unwrap();

        let config = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(config.coordinator.address, "a:1");
        assert_eq!(AgentConfig::load_log_level(Some(&path)).as_deref(), Some("TRACE"));
    }

    #[test]
    fn test_load_explicit_path_missing_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing.yml");
        assert!(AgentConfig::load(Some(&path)).is_err());
        assert!(AgentConfig::load_log_level(Some(&path)).is_none());
    }

    #[test]
    #[serial]
    fn test_token_from_literal_wins() {
        let config = CoordinatorConfig {
            token: Some("literal".to_string()),
            token_env: "LOADAGENT_TEST_TOKEN_A".to_string(),
            ..Default::default()
        };
        unsafe { std::env::set_var("LOADAGENT_TEST_TOKEN_A", "from-env") };
        assert_eq!(config.resolve_token().unwrap(), "literal");
        unsafe { std::env::remove_var("LOADAGENT_TEST_TOKEN_A") };
    }

    #[test]
    #[serial]
    fn test_token_from_env() {
        let config = CoordinatorConfig {
            token_env: "LOADAGENT_TEST_TOKEN_B".to_string(),
            ..Default::default()
        };
        unsafe { std::env::remove_var("LOADAGENT_TEST_TOKEN_B") };
        assert!(config.resolve_token().is_err());

        unsafe { std::env::set_var("LOADAGENT_TEST_TOKEN_B", "from-env") };
        assert_eq!(config.resolve_token().unwrap(), "from-env");
        unsafe { std::env::remove_var("LOADAGENT_TEST_TOKEN_B") };
    }
}
