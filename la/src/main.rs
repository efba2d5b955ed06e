//! loadagent - remote-controlled workload agent
//!
//! CLI entry point: runs the agent (`connect`, `serve`) or talks to a running
//! one over its observer socket (`start`, `stop`, `status`, `watch`).

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use loadagent::cli::{Cli, Command, OutputFormat};
use loadagent::config::AgentConfig;
use loadagent::lifecycle::{ControlError, LifecycleController, StatusSnapshot};
use loadagent::link::{CloseReason, CoordinatorLink, LinkSettings, WebSocketDialer};
use loadagent::metrics::{Metric, MetricBroker};
use loadagent::observer::{self, ObserverClient, ObserverEndpoint};
use loadagent::workload::SimulatedFactory;

/// How long `connect` waits for the link to close after a shutdown signal
const LINK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("loadagent")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("loadagent.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Log level comes from the config file before the full load
    let config_log_level = AgentConfig::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = AgentConfig::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(version = env!("GIT_DESCRIBE"), "loadagent loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Connect { address, token } => cmd_connect(&config, address, token).await,
        Command::Serve => cmd_serve(&config).await,
        Command::Start { format } => cmd_control(&config, ControlAction::Start, format).await,
        Command::Stop { format } => cmd_control(&config, ControlAction::Stop, format).await,
        Command::Status { format } => cmd_control(&config, ControlAction::Status, format).await,
        Command::Watch { count, format } => cmd_watch(&config, count, format).await,
    }
}

/// Broker and lifecycle controller backed by the simulated workload
fn build_core(config: &AgentConfig) -> (Arc<MetricBroker>, Arc<LifecycleController>) {
    let broker = Arc::new(MetricBroker::new(
        config.broker.delivery_timeout(),
        config.broker.subscriber_buffer,
    ));
    let factory = Arc::new(SimulatedFactory::new(config.simulation.clone()));
    let controller = Arc::new(LifecycleController::spawn(
        factory,
        broker.clone(),
        config.broker.producer_buffer,
    ));
    (broker, controller)
}

/// A running observer endpoint and what is needed to tear it down
struct ObserverHandle {
    socket_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ObserverHandle {
    fn start(config: &AgentConfig, controller: Arc<LifecycleController>, broker: Arc<MetricBroker>) -> Result<Self> {
        let (listener, socket_path) = observer::create_listener_at(&config.observer.socket_path())?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = ObserverEndpoint::new(controller, broker).spawn(listener, shutdown_rx);
        Ok(Self {
            socket_path,
            shutdown_tx,
            task,
        })
    }

    async fn shutdown(self) {
        debug!("ObserverHandle::shutdown: called");
        self.shutdown_tx.send_replace(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "observer endpoint task failed");
        }
        observer::cleanup_socket(&self.socket_path);
    }
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => warn!("SIGINT received"),
            _ = sigterm.recv() => warn!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        warn!("ctrl_c received");
    }

    Ok(())
}

/// Stop the workload on the way out; an uninitialised controller is fine
async fn stop_workload(controller: &LifecycleController) {
    match controller.stop().await {
        Ok(()) | Err(ControlError::NotInitialised) => {}
        Err(e) => error!(error = %e, "failed to stop workload during shutdown"),
    }
}

/// Run a session with the controller, plus the observer endpoint
async fn cmd_connect(config: &AgentConfig, address: Option<String>, token: Option<String>) -> Result<()> {
    debug!(?address, "cmd_connect: called");
    let address = address.unwrap_or_else(|| config.coordinator.address.clone());
    let token = match token {
        Some(token) => token,
        None => config.coordinator.resolve_token()?,
    };

    let (broker, controller) = build_core(config);

    let observer = if config.observer.enabled {
        Some(ObserverHandle::start(config, controller.clone(), broker.clone())?)
    } else {
        debug!("cmd_connect: observer endpoint disabled");
        None
    };

    let dialer = Arc::new(WebSocketDialer::new(
        &address,
        &config.coordinator.path,
        config.coordinator.dial_timeout(),
    ));
    println!("Connecting to {}...", dialer.url());
    let settings = LinkSettings {
        token,
        outbound_buffer: config.coordinator.outbound_buffer,
        inbound_buffer: config.coordinator.inbound_buffer,
        reset_policy: config.coordinator.reset_policy,
    };
    let link = CoordinatorLink::new(dialer, settings, controller.clone(), broker);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let mut link_handle = tokio::spawn(link.run(shutdown_rx));

    let joined = tokio::select! {
        signal = wait_for_shutdown_signal() => {
            signal?;
            info!("shutting down; saying bye to controller");
            let _ = shutdown_tx.send(()).await;
            match tokio::time::timeout(LINK_SHUTDOWN_TIMEOUT, &mut link_handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("coordinator link did not close in time; abandoning it");
                    link_handle.abort();
                    Ok(CloseReason::Shutdown)
                }
            }
        }
        joined = &mut link_handle => joined,
    };

    let reason = match joined {
        Ok(reason) => reason,
        Err(e) => {
            error!(error = %e, "coordinator link task failed");
            CloseReason::TransportClosed
        }
    };
    info!(%reason, "coordinator session ended");

    if let Some(observer) = observer {
        observer.shutdown().await;
    }
    stop_workload(&controller).await;

    match reason {
        CloseReason::Shutdown | CloseReason::TransportClosed => {
            println!("Session ended: {}", reason);
            Ok(())
        }
        _ => Err(eyre::eyre!("Session ended: {}", reason)),
    }
}

/// Run without a controller, serving only local observers
async fn cmd_serve(config: &AgentConfig) -> Result<()> {
    debug!("cmd_serve: called");
    if !config.observer.enabled {
        return Err(eyre::eyre!(
            "serve needs the observer endpoint; set observer.enabled to true"
        ));
    }

    let (broker, controller) = build_core(config);
    controller
        .reconfigure(config.workload.clone())
        .await
        .context("Failed to initialise workload")?;

    let observer = ObserverHandle::start(config, controller.clone(), broker)?;
    println!("Serving on {}", observer.socket_path.display());
    info!("Agent running standalone. Press Ctrl+C to stop.");

    wait_for_shutdown_signal().await?;

    info!("Agent shutting down...");
    observer.shutdown().await;
    stop_workload(&controller).await;
    debug!("cmd_serve: shutdown complete");
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum ControlAction {
    Start,
    Stop,
    Status,
}

fn observer_client(config: &AgentConfig) -> Result<ObserverClient> {
    let client = ObserverClient::with_socket_path(config.observer.socket_path());
    if !client.socket_exists() {
        return Err(eyre::eyre!(
            "No agent socket at {}. Is the agent running?",
            client.socket_path().display()
        ));
    }
    Ok(client)
}

async fn cmd_control(config: &AgentConfig, action: ControlAction, format: OutputFormat) -> Result<()> {
    debug!(?action, ?format, "cmd_control: called");
    let client = observer_client(config)?;
    let status = match action {
        ControlAction::Start => client.start().await?,
        ControlAction::Stop => client.stop().await?,
        ControlAction::Status => client.status().await?,
    };
    print_status(&status, format)
}

fn print_status(status: &StatusSnapshot, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(status).context("Failed to serialize status")?);
        }
        OutputFormat::Text => {
            let state = if status.running {
                "running".green()
            } else {
                "stopped".red()
            };
            match &status.config_hash {
                Some(hash) => println!("Workload: {} (config {})", state, hash),
                None => println!("Workload: {} (not configured)", state),
            }
        }
    }
    Ok(())
}

async fn cmd_watch(config: &AgentConfig, count: Option<usize>, format: OutputFormat) -> Result<()> {
    debug!(?count, ?format, "cmd_watch: called");
    let client = observer_client(config)?;
    let seen = client.watch(count, |metric| print_metric(&metric, format)).await?;
    debug!(seen, "cmd_watch: done");
    Ok(())
}

fn print_metric(metric: &Metric, format: OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string(metric) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("{} {}", "Error:".red(), e),
        },
        OutputFormat::Text => {
            let kind = format!("{:?}", metric.kind);
            if metric.data.is_null() {
                println!("{} {}", metric.ts.format("%H:%M:%S%.3f"), kind.cyan());
            } else {
                println!("{} {} {}", metric.ts.format("%H:%M:%S%.3f"), kind.cyan(), metric.data);
            }
        }
    }
}
