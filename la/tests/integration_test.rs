//! Integration tests for loadagent
//!
//! These drive a full coordinator session over an in-memory transport against a
//! deterministic fake workload, and exercise the observer endpoint over a real
//! Unix socket.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use loadagent::lifecycle::{LifecycleController, ResetPolicy, StatusSnapshot};
use loadagent::link::{AgentMessage, ChannelDialer, CloseReason, ControllerMessage, CoordinatorLink, LinkSettings, PeerEnd};
use loadagent::metrics::{Metric, MetricBroker, MetricKind, Summary};
use loadagent::observer::{self, ObserverClient, ObserverEndpoint};
use loadagent::workload::{MetricSink, Workload, WorkloadConfig, WorkloadError, WorkloadFactory};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Fake workload
// =============================================================================

struct FakeWorkload {
    config: WorkloadConfig,
    metrics: MetricSink,
    emit_on_start: bool,
    fail_stop: bool,
    running: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

#[async_trait]
impl Workload for FakeWorkload {
    async fn start(&self) -> Result<(), WorkloadError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        if self.emit_on_start {
            for metric in [
                Metric::counter(MetricKind::IncBadTrunk),
                Metric::counter(MetricKind::IncSuccessfulTx),
                Metric::counter(MetricKind::IncFailedTx),
                Metric::summary(&Summary::default()),
            ] {
                let _ = self.metrics.send(metric).await;
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), WorkloadError> {
        if self.fail_stop {
            return Err(WorkloadError::ShutdownFailed("engine wedged".to_string()));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeFactory {
    emit_on_start: bool,
    fail_stop: bool,
    fail_configure: bool,
    built: Mutex<Vec<Arc<FakeWorkload>>>,
}

impl FakeFactory {
    fn built(&self) -> Vec<Arc<FakeWorkload>> {
        self.built.lock().unwrap().clone()
    }
}

impl WorkloadFactory for FakeFactory {
    fn configure(&self, config: &WorkloadConfig, metrics: MetricSink) -> Result<Arc<dyn Workload>, WorkloadError> {
        config.validate()?;
        if self.fail_configure {
            return Err(WorkloadError::Start("no engine available".to_string()));
        }
        let workload = Arc::new(FakeWorkload {
            config: config.clone(),
            metrics,
            emit_on_start: self.emit_on_start,
            fail_stop: self.fail_stop,
            running: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        });
        self.built.lock().unwrap().push(workload.clone());
        Ok(workload)
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Session {
    peer: PeerEnd,
    factory: Arc<FakeFactory>,
    controller: Arc<LifecycleController>,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<CloseReason>,
}

fn start_session(factory: FakeFactory, reset_policy: ResetPolicy) -> Session {
    let settings = LinkSettings {
        token: "token".to_string(),
        reset_policy,
        ..Default::default()
    };
    start_session_with(factory, settings, 64)
}

/// Session whose in-memory transport holds `transport_buffer` frames each way
fn start_session_with(factory: FakeFactory, settings: LinkSettings, transport_buffer: usize) -> Session {
    let factory = Arc::new(factory);
    let broker = Arc::new(MetricBroker::with_defaults());
    let controller = Arc::new(LifecycleController::spawn(factory.clone(), broker.clone(), 64));
    let (dialer, peer) = ChannelDialer::new(transport_buffer);
    let link = CoordinatorLink::new(Arc::new(dialer), settings, controller.clone(), broker);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let handle = tokio::spawn(link.run(shutdown_rx));
    Session {
        peer,
        factory,
        controller,
        shutdown_tx,
        handle,
    }
}

impl Session {
    async fn recv(&mut self) -> Option<AgentMessage> {
        let frame = tokio::time::timeout(RECV_TIMEOUT, self.peer.recv())
            .await
            .expect("timed out waiting for agent frame")?;
        Some(AgentMessage::from_frame(&frame).unwrap())
    }

    async fn recv_status(&mut self) -> StatusSnapshot {
        loop {
            match self.recv().await {
                Some(AgentMessage::StatusReport(status)) => return status,
                Some(AgentMessage::Metric(_)) => continue,
                other => panic!("expected status report, got {:?}", other),
            }
        }
    }

    async fn send(&self, msg: ControllerMessage) {
        assert!(self.peer.send(msg.to_frame().unwrap()).await);
    }

    /// Consume the hello, answer with a welcome and consume the initial status
    async fn welcome(&mut self, config: &WorkloadConfig) -> StatusSnapshot {
        assert!(matches!(self.recv().await, Some(AgentMessage::Hello { .. })));
        self.send(ControllerMessage::Welcome(serde_json::to_value(config).unwrap()))
            .await;
        self.recv_status().await
    }

    async fn finish(self) -> CloseReason {
        tokio::time::timeout(RECV_TIMEOUT, self.handle)
            .await
            .expect("session did not end")
            .unwrap()
    }
}

fn config_with_mwm(mwm: u64) -> WorkloadConfig {
    WorkloadConfig {
        mwm,
        ..Default::default()
    }
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn test_token_invalid_ends_session_without_workload() {
    let mut session = start_session(FakeFactory::default(), ResetPolicy::PreviousState);

    assert_eq!(
        session.recv().await,
        Some(AgentMessage::Hello {
            token: "token".to_string()
        })
    );
    session.send(ControllerMessage::TokenInvalid).await;

    // No further traffic, transport closed
    assert_eq!(session.recv().await, None);
    assert!(session.factory.built().is_empty());
    assert!(!session.controller.is_initialised());
    assert_eq!(session.finish().await, CloseReason::Rejected);
}

#[tokio::test]
async fn test_malformed_welcome_sends_one_internal_error() {
    let mut session = start_session(FakeFactory::default(), ResetPolicy::PreviousState);

    session.recv().await;
    session
        .send(ControllerMessage::Welcome(json!({"mwm": "not a number"})))
        .await;

    assert_eq!(session.recv().await, Some(AgentMessage::InternalError));
    assert_eq!(session.recv().await, None);
    assert!(session.factory.built().is_empty());
    assert_eq!(session.finish().await, CloseReason::InvalidConfig);
}

#[tokio::test]
async fn test_unexpected_handshake_reply_is_protocol_violation() {
    let mut session = start_session(FakeFactory::default(), ResetPolicy::PreviousState);

    session.recv().await;
    session.send(ControllerMessage::Start).await;

    assert_eq!(session.recv().await, None);
    assert!(session.factory.built().is_empty());
    assert_eq!(session.finish().await, CloseReason::ProtocolViolation);
}

#[tokio::test]
async fn test_workload_init_failure_sends_one_internal_error() {
    let factory = FakeFactory {
        fail_configure: true,
        ..Default::default()
    };
    let mut session = start_session(factory, ResetPolicy::PreviousState);

    session.recv().await;
    session
        .send(ControllerMessage::Welcome(serde_json::to_value(WorkloadConfig::default()).unwrap()))
        .await;

    assert_eq!(session.recv().await, Some(AgentMessage::InternalError));
    assert_eq!(session.recv().await, None);
    assert!(!session.controller.is_initialised());
    assert_eq!(session.finish().await, CloseReason::WorkloadInitFailed);
}

#[tokio::test]
async fn test_welcome_installs_config_and_reports_status() {
    let mut session = start_session(FakeFactory::default(), ResetPolicy::PreviousState);
    let config = config_with_mwm(9);

    let status = session.welcome(&config).await;

    assert_eq!(status.config_hash, Some(config.fingerprint()));
    assert!(!status.running);
    assert_eq!(session.factory.built().len(), 1);
    assert_eq!(session.factory.built()[0].config, config);
}

// =============================================================================
// Command dispatch
// =============================================================================

#[tokio::test]
async fn test_start_twice_starts_once_reports_twice() {
    let mut session = start_session(FakeFactory::default(), ResetPolicy::PreviousState);
    session.welcome(&WorkloadConfig::default()).await;

    session.send(ControllerMessage::Start).await;
    assert!(session.recv_status().await.running);
    session.send(ControllerMessage::Start).await;
    assert!(session.recv_status().await.running);

    assert_eq!(session.factory.built()[0].starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_when_stopped_is_quiet() {
    let mut session = start_session(FakeFactory::default(), ResetPolicy::PreviousState);
    session.welcome(&WorkloadConfig::default()).await;

    session.send(ControllerMessage::Stop).await;
    assert!(!session.recv_status().await.running);
    assert_eq!(session.factory.built()[0].stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_stop_still_reports_running() {
    let factory = FakeFactory {
        fail_stop: true,
        ..Default::default()
    };
    let mut session = start_session(factory, ResetPolicy::PreviousState);
    session.welcome(&WorkloadConfig::default()).await;
    session.send(ControllerMessage::Start).await;
    assert!(session.recv_status().await.running);

    session.send(ControllerMessage::Stop).await;
    let status = session.recv_status().await;
    assert!(status.running);
    assert_eq!(status.config_hash, Some(WorkloadConfig::default().fingerprint()));
    assert!(session.controller.status().running);
}

#[tokio::test]
async fn test_restart_with_failed_stop_skips_start() {
    let factory = FakeFactory {
        fail_stop: true,
        ..Default::default()
    };
    let mut session = start_session(factory, ResetPolicy::PreviousState);
    session.welcome(&WorkloadConfig::default()).await;
    session.send(ControllerMessage::Start).await;
    session.recv_status().await;

    session.send(ControllerMessage::Restart).await;
    assert!(session.recv_status().await.running);
    let workload = session.factory.built()[0].clone();
    assert_eq!(workload.starts.load(Ordering::SeqCst), 1);
    assert_eq!(workload.stops.load(Ordering::SeqCst), 0);

    // The session keeps serving commands afterwards
    session.send(ControllerMessage::Metrics).await;
    assert!(session.recv_status().await.running);
}

#[tokio::test]
async fn test_start_stop_restart_sequence_tracks_last_request() {
    let mut session = start_session(FakeFactory::default(), ResetPolicy::PreviousState);
    session.welcome(&WorkloadConfig::default()).await;

    let steps = [
        (ControllerMessage::Start, true),
        (ControllerMessage::Stop, false),
        (ControllerMessage::Restart, true),
        (ControllerMessage::Restart, true),
        (ControllerMessage::Stop, false),
        (ControllerMessage::Stop, false),
    ];
    for (command, expected) in steps {
        session.send(command.clone()).await;
        assert_eq!(session.recv_status().await.running, expected, "after {:?}", command);
    }
}

#[tokio::test]
async fn test_metrics_ack_and_unknown_still_report_status() {
    let mut session = start_session(FakeFactory::default(), ResetPolicy::PreviousState);
    session.welcome(&WorkloadConfig::default()).await;

    session.send(ControllerMessage::Metrics).await;
    session.recv_status().await;
    assert!(session.peer.send(r#"{"type":"self_destruct"}"#).await);
    session.recv_status().await;
}

#[tokio::test]
async fn test_reset_config_while_running_restarts_new_handle() {
    let mut session = start_session(FakeFactory::default(), ResetPolicy::PreviousState);
    session.welcome(&WorkloadConfig::default()).await;
    session.send(ControllerMessage::Start).await;
    session.recv_status().await;

    let new_config = config_with_mwm(10);
    session
        .send(ControllerMessage::ResetConfig(serde_json::to_value(&new_config).unwrap()))
        .await;
    let status = session.recv_status().await;

    assert!(status.running);
    assert_eq!(status.config_hash, Some(new_config.fingerprint()));
    let built = session.factory.built();
    assert_eq!(built.len(), 2);
    assert!(!built[0].is_running());
    assert_eq!(built[0].stops.load(Ordering::SeqCst), 1);
    assert_eq!(built[1].starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reset_config_while_stopped_stays_stopped() {
    let mut session = start_session(FakeFactory::default(), ResetPolicy::PreviousState);
    session.welcome(&WorkloadConfig::default()).await;

    let new_config = config_with_mwm(11);
    session
        .send(ControllerMessage::ResetConfig(serde_json::to_value(&new_config).unwrap()))
        .await;
    let status = session.recv_status().await;

    assert!(!status.running);
    assert_eq!(status.config_hash, Some(new_config.fingerprint()));
    assert_eq!(session.factory.built()[1].starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reset_config_always_start_policy() {
    let mut session = start_session(FakeFactory::default(), ResetPolicy::AlwaysStart);
    session.welcome(&WorkloadConfig::default()).await;

    session
        .send(ControllerMessage::ResetConfig(serde_json::to_value(config_with_mwm(12)).unwrap()))
        .await;
    assert!(session.recv_status().await.running);
}

#[tokio::test]
async fn test_malformed_reset_config_preserves_state() {
    let mut session = start_session(FakeFactory::default(), ResetPolicy::PreviousState);
    let config = WorkloadConfig::default();
    session.welcome(&config).await;
    session.send(ControllerMessage::Start).await;
    session.recv_status().await;

    session
        .send(ControllerMessage::ResetConfig(json!({"security_lvl": 9})))
        .await;

    assert_eq!(session.recv().await, Some(AgentMessage::InternalError));
    let status = session.recv_status().await;
    assert!(status.running);
    assert_eq!(status.config_hash, Some(config.fingerprint()));
    assert_eq!(session.factory.built().len(), 1);
    assert_eq!(session.factory.built()[0].stops.load(Ordering::SeqCst), 0);
}

// =============================================================================
// Metric relay
// =============================================================================

#[tokio::test]
async fn test_only_summary_and_success_metrics_go_upstream() {
    let factory = FakeFactory {
        emit_on_start: true,
        ..Default::default()
    };
    let mut session = start_session(factory, ResetPolicy::PreviousState);
    session.welcome(&WorkloadConfig::default()).await;
    session.send(ControllerMessage::Start).await;

    let mut kinds = Vec::new();
    let mut saw_status = false;
    while !(saw_status && kinds.contains(&MetricKind::Summary)) {
        match session.recv().await {
            Some(AgentMessage::Metric(metric)) => kinds.push(metric.kind),
            Some(AgentMessage::StatusReport(_)) => saw_status = true,
            other => panic!("unexpected frame {:?}", other),
        }
    }

    assert_eq!(kinds, vec![MetricKind::IncSuccessfulTx, MetricKind::Summary]);
}

// =============================================================================
// Session end
// =============================================================================

#[tokio::test]
async fn test_no_status_after_inbound_closes() {
    let mut session = start_session(FakeFactory::default(), ResetPolicy::PreviousState);
    session.welcome(&WorkloadConfig::default()).await;
    session.send(ControllerMessage::Start).await;
    session.recv_status().await;

    // Controller hangs up its sending side
    let (replacement, _unused) = mpsc::channel(1);
    drop(std::mem::replace(&mut session.peer.tx, replacement));

    assert_eq!(session.recv().await, None);
    assert_eq!(session.finish().await, CloseReason::TransportClosed);
}

#[tokio::test]
async fn test_shutdown_says_bye_and_closes() {
    let mut session = start_session(FakeFactory::default(), ResetPolicy::PreviousState);
    session.welcome(&WorkloadConfig::default()).await;

    session.shutdown_tx.send(()).await.unwrap();

    assert_eq!(session.recv().await, Some(AgentMessage::Bye));
    assert_eq!(session.recv().await, None);
    assert_eq!(session.finish().await, CloseReason::Shutdown);
}

#[tokio::test]
async fn test_shutdown_closes_transport_when_controller_stops_reading() {
    let settings = LinkSettings {
        token: "token".to_string(),
        outbound_buffer: 1,
        ..Default::default()
    };
    let mut session = start_session_with(FakeFactory::default(), settings, 1);
    session.welcome(&WorkloadConfig::default()).await;

    // Each metrics ack queues a status report nobody collects
    for _ in 0..10 {
        session.send(ControllerMessage::Metrics).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.shutdown_tx.send(()).await.unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(5), session.handle)
        .await
        .expect("link kept the transport open after shutdown")
        .unwrap();
    assert_eq!(reason, CloseReason::Shutdown);

    // Whatever was in flight drains, then the stream ends
    let mut frames = 0;
    while let Some(frame) = session.peer.recv().await {
        assert!(AgentMessage::from_frame(&frame).is_ok());
        frames += 1;
    }
    assert!(frames <= 1);
}

// =============================================================================
// Observer endpoint
// =============================================================================

#[tokio::test]
async fn test_observer_client_controls_workload_and_watches_metrics() {
    let temp = TempDir::new().unwrap();
    let socket_path = temp.path().join("observer.sock");
    let (listener, _) = observer::create_listener_at(&socket_path).unwrap();

    let factory = Arc::new(FakeFactory::default());
    let broker = Arc::new(MetricBroker::with_defaults());
    let controller = Arc::new(LifecycleController::spawn(factory.clone(), broker.clone(), 16));
    controller.reconfigure(WorkloadConfig::default()).await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let endpoint = ObserverEndpoint::new(controller.clone(), broker.clone()).spawn(listener, shutdown_rx);

    let client = ObserverClient::with_socket_path(socket_path.clone());
    assert!(client.start().await.unwrap().running);
    assert!(client.status().await.unwrap().running);
    assert!(!client.stop().await.unwrap().running);
    assert_eq!(factory.built()[0].starts.load(Ordering::SeqCst), 1);

    let watcher = tokio::spawn(async move {
        let mut received = Vec::new();
        let seen = client.watch(Some(2), |metric| received.push(metric.kind)).await.unwrap();
        (seen, received)
    });
    // Publish until the watcher has subscribed and collected enough
    let mut attempts = 0;
    while !watcher.is_finished() && attempts < 100 {
        broker.publish(Metric::counter(MetricKind::IncFailedTx)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        attempts += 1;
    }
    let (seen, received) = watcher.await.unwrap();
    assert_eq!(seen, 2);
    assert_eq!(received, vec![MetricKind::IncFailedTx, MetricKind::IncFailedTx]);

    shutdown_tx.send_replace(true);
    tokio::time::timeout(RECV_TIMEOUT, endpoint).await.unwrap().unwrap();
    observer::cleanup_socket(&socket_path);
    assert!(!socket_path.exists());
}

// =============================================================================
// CLI
// =============================================================================

#[test]
fn test_cli_help_lists_commands() {
    use assert_cmd::Command;
    use predicates::prelude::*;

    Command::cargo_bin("la")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("connect").and(predicate::str::contains("serve")));
}

#[test]
fn test_cli_without_command_fails() {
    use assert_cmd::Command;

    Command::cargo_bin("la").unwrap().assert().failure();
}
