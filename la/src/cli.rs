//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

/// loadagent - remote-controlled workload agent
#[derive(Parser)]
#[command(
    name = "la",
    about = "Workload agent driven by a remote controller and observable over a local socket",
    version = env!("GIT_DESCRIBE"),
    after_help = after_help()
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to the controller and obey its commands
    Connect {
        /// Controller host:port (overrides config)
        #[arg(short, long)]
        address: Option<String>,

        /// API token (overrides config and environment)
        #[arg(short, long)]
        token: Option<String>,
    },

    /// Run standalone with the configured workload, controlled only over the local socket
    Serve,

    /// Start the workload of a running agent
    Start {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Stop the workload of a running agent
    Stop {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the workload state of a running agent
    Status {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Stream metrics from a running agent
    Watch {
        /// Exit after this many metrics
        #[arg(short = 'n', long)]
        count: Option<usize>,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Where the log file is written
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("loadagent")
        .join("logs")
        .join("loadagent.log")
}

fn after_help() -> String {
    format!("Logs are written to: {}", get_log_path().display())
}

/// Output format for client commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
