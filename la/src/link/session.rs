//! CoordinatorLink - one session with the controller, from dial to close

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{Connection, ConnectionSender};
use super::messages::{AgentMessage, ControllerMessage};
use super::state::{CloseReason, HandshakeOutcome, LinkState, on_handshake_reply};
use super::transport::Dialer;
use crate::lifecycle::{ControlError, LifecycleController, ResetPolicy};
use crate::metrics::{Metric, MetricBroker};
use crate::workload::WorkloadConfig;

/// How long a shutdown waits for room on the outbound queue for its bye
const BYE_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-session settings
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Credential sent in the hello
    pub token: String,
    pub outbound_buffer: usize,
    pub inbound_buffer: usize,
    /// How `reset_config` resumes the workload
    pub reset_policy: ResetPolicy,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            token: String::new(),
            outbound_buffer: 64,
            inbound_buffer: 64,
            reset_policy: ResetPolicy::default(),
        }
    }
}

/// The agent side of the coordinator protocol
///
/// A link runs exactly one session. Dial failures and closed transports end it;
/// retrying is up to whoever owns the link.
pub struct CoordinatorLink {
    dialer: Arc<dyn Dialer>,
    settings: LinkSettings,
    controller: Arc<LifecycleController>,
    broker: Arc<MetricBroker>,
    state_tx: watch::Sender<LinkState>,
}

impl CoordinatorLink {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        settings: LinkSettings,
        controller: Arc<LifecycleController>,
        broker: Arc<MetricBroker>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            dialer,
            settings,
            controller,
            broker,
            state_tx,
        }
    }

    /// Watch the link's state as it moves through the session
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, next: LinkState) {
        let current = self.state_tx.borrow().clone();
        if !current.allows(&next) {
            warn!(from = %current, to = %next, "unexpected link state transition");
        }
        info!(from = %current, to = %next, "link state");
        self.state_tx.send_replace(next);
    }

    /// Close the connection and record why
    async fn close(&self, conn: Connection, reason: CloseReason) -> CloseReason {
        conn.finish().await;
        self.transition(LinkState::Closed(reason));
        reason
    }

    /// Run the session to completion
    ///
    /// A message on `shutdown_rx` sends a best-effort bye and closes the
    /// transport, forcing it shut if the controller has stopped reading.
    /// Dropping the sender does not count as a shutdown request.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> CloseReason {
        debug!(target = %self.dialer.target(), "CoordinatorLink::run: called");

        self.transition(LinkState::Dialing);
        let transport = match self.dialer.dial().await {
            Ok(transport) => transport,
            Err(e) => {
                error!(target = %self.dialer.target(), error = %e, "failed to dial controller");
                self.transition(LinkState::Closed(CloseReason::DialFailed));
                return CloseReason::DialFailed;
            }
        };

        let mut conn = Connection::spawn(transport, self.settings.outbound_buffer, self.settings.inbound_buffer);
        let sender = conn.sender();
        let Some(mut inbound) = conn.take_inbound() else {
            return self.close(conn, CloseReason::TransportClosed).await;
        };

        let hello = AgentMessage::Hello {
            token: self.settings.token.clone(),
        };
        if let Err(e) = sender.send(hello).await {
            warn!(error = %e, "failed to send hello");
            return self.close(conn, CloseReason::TransportClosed).await;
        }
        self.transition(LinkState::HandshakeSent);

        let reply = tokio::select! {
            _ = shutdown_requested(&mut shutdown_rx) => {
                info!("shutdown requested during handshake");
                if let Err(e) = sender.send_within(AgentMessage::Bye, BYE_TIMEOUT).await {
                    warn!(error = %e, "bye not sent");
                }
                return self.close(conn, CloseReason::Shutdown).await;
            }
            reply = inbound.recv() => reply,
        };
        let Some(reply) = reply else {
            warn!("controller hung up before answering hello");
            return self.close(conn, CloseReason::TransportClosed).await;
        };

        let config = match on_handshake_reply(&reply) {
            HandshakeOutcome::Rejected => {
                error!("controller rejected our API token");
                self.transition(LinkState::Rejected);
                return self.close(conn, CloseReason::Rejected).await;
            }
            HandshakeOutcome::InvalidConfig(e) => {
                error!(error = %e, "welcome carried an invalid workload configuration");
                let _ = sender.send(AgentMessage::InternalError).await;
                return self.close(conn, CloseReason::InvalidConfig).await;
            }
            HandshakeOutcome::ProtocolViolation(e) => {
                error!(error = %e, "unexpected handshake reply");
                return self.close(conn, CloseReason::ProtocolViolation).await;
            }
            HandshakeOutcome::Welcomed(config) => config,
        };
        self.transition(LinkState::Welcomed {
            fingerprint: config.fingerprint(),
        });

        if let Err(e) = self.install_initial(config).await {
            error!(error = %e, "couldn't initialise workload");
            let _ = sender.send(AgentMessage::InternalError).await;
            return self.close(conn, CloseReason::WorkloadInitFailed).await;
        }
        self.transition(LinkState::Communicating);

        let (subscriber_id, metric_rx) = self.broker.subscribe().await;
        let relay = spawn_upstream_relay(metric_rx, sender.clone());
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let watcher = spawn_shutdown_watcher(shutdown_rx, sender.clone(), shutdown_flag.clone());

        self.send_status(&sender).await;

        while let Some(msg) = inbound.recv().await {
            self.dispatch(msg, &sender).await;
            self.send_status(&sender).await;
        }
        debug!("CoordinatorLink::run: inbound queue closed");

        self.broker.unsubscribe(subscriber_id).await;
        relay.abort();
        watcher.abort();

        let reason = if shutdown_flag.load(Ordering::SeqCst) {
            CloseReason::Shutdown
        } else {
            CloseReason::TransportClosed
        };
        self.close(conn, reason).await
    }

    /// Replace whatever the controller held with the welcome config
    async fn install_initial(&self, config: WorkloadConfig) -> Result<(), ControlError> {
        if self.controller.is_initialised() {
            self.controller.stop().await?;
        }
        self.controller.reconfigure(config).await
    }

    /// Apply one inbound message to the lifecycle controller
    async fn dispatch(&self, msg: ControllerMessage, sender: &ConnectionSender) {
        debug!(kind = msg.kind(), "CoordinatorLink::dispatch: called");
        let result = match msg {
            ControllerMessage::Start => {
                info!("got workload start msg");
                self.controller.start().await
            }
            ControllerMessage::Stop => {
                info!("got workload stop msg");
                self.controller.stop().await
            }
            ControllerMessage::Restart => {
                info!("got workload restart msg");
                self.controller.restart().await
            }
            ControllerMessage::ResetConfig(payload) => {
                info!("got workload reset config msg");
                self.controller.reset_config(&payload, self.settings.reset_policy).await
            }
            ControllerMessage::Metrics => {
                info!("got workload metrics msg");
                Ok(())
            }
            ControllerMessage::Unknown(kind) => {
                warn!(kind = %kind, "got an unknown msg type from controller");
                Ok(())
            }
            other @ (ControllerMessage::TokenInvalid | ControllerMessage::Welcome(_)) => {
                warn!(kind = other.kind(), "ignoring handshake message after welcome");
                Ok(())
            }
        };

        match result {
            Ok(()) => {}
            Err(ControlError::NotInitialised) => {
                warn!("workload is not initialised; command skipped");
            }
            Err(e @ ControlError::ConfigParse(_)) => {
                warn!(error = %e, "couldn't reset configuration");
                if let Err(e) = sender.send(AgentMessage::InternalError).await {
                    debug!(error = %e, "CoordinatorLink::dispatch: internal error not sent");
                }
            }
            Err(e) => {
                error!(error = %e, "workload command failed");
            }
        }
    }

    async fn send_status(&self, sender: &ConnectionSender) {
        let status = self.controller.status();
        debug!(?status, "CoordinatorLink::send_status: called");
        if let Err(e) = sender.send(AgentMessage::StatusReport(status)).await {
            warn!(error = %e, "couldn't send workload state");
        }
    }
}

/// Resolve on an explicit shutdown request; a dropped sender never resolves
async fn shutdown_requested(rx: &mut mpsc::Receiver<()>) {
    if rx.recv().await.is_none() {
        std::future::pending::<()>().await;
    }
}

/// Forward summary and success metrics upstream until eviction or close
fn spawn_upstream_relay(mut metric_rx: mpsc::Receiver<Metric>, sender: ConnectionSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(metric) = metric_rx.recv().await {
            if !metric.kind.is_relayed_upstream() {
                continue;
            }
            if sender.send(AgentMessage::Metric(metric)).await.is_err() {
                debug!("spawn_upstream_relay: connection closed");
                return;
            }
        }
        warn!("metric subscription evicted; closing connection");
        sender.close().await;
    })
}

fn spawn_shutdown_watcher(
    mut shutdown_rx: mpsc::Receiver<()>,
    sender: ConnectionSender,
    flag: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_requested(&mut shutdown_rx).await;
        info!("shutdown requested; saying bye to controller");
        flag.store(true, Ordering::SeqCst);
        if let Err(e) = sender.send_within(AgentMessage::Bye, BYE_TIMEOUT).await {
            warn!(error = %e, "bye not sent");
        }
        sender.close().await;
    })
}
