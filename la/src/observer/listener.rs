//! Local observer endpoint
//!
//! Binds a Unix Domain Socket and serves any number of observers at once. Each
//! connection is its own broker subscriber: metrics stream out as they are
//! produced, and every inbound line is answered with the current state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::get_socket_path;
use super::messages::{Envelope, MAX_MESSAGE_SIZE, MsgType};
use crate::lifecycle::LifecycleController;
use crate::metrics::MetricBroker;

/// Outgoing envelopes queued per observer
const WRITER_BUFFER: usize = 32;

/// Create and bind the observer socket at the default path
pub fn create_listener() -> Result<(UnixListener, PathBuf)> {
    create_listener_at(&get_socket_path())
}

/// Create the observer socket at `socket_path`
///
/// Creates missing parent directories and replaces a stale socket file.
pub fn create_listener_at(socket_path: &Path) -> Result<(UnixListener, PathBuf)> {
    debug!(?socket_path, "create_listener_at: called");

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    if socket_path.exists() {
        debug!(?socket_path, "create_listener_at: removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(socket_path).context("Failed to bind observer socket")?;
    info!(?socket_path, "observer socket listening");
    Ok((listener, socket_path.to_path_buf()))
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &Path) {
    if socket_path.exists() {
        debug!(?socket_path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

/// Accepts observers and runs one session per connection
pub struct ObserverEndpoint {
    controller: Arc<LifecycleController>,
    broker: Arc<MetricBroker>,
}

impl ObserverEndpoint {
    pub fn new(controller: Arc<LifecycleController>, broker: Arc<MetricBroker>) -> Self {
        Self { controller, broker }
    }

    /// Serve until `shutdown` flips to true
    ///
    /// Open sessions are aborted on shutdown.
    pub async fn serve(&self, listener: UnixListener, mut shutdown: watch::Receiver<bool>) {
        debug!("ObserverEndpoint::serve: called");
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!(open = sessions.len(), "observer endpoint shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let controller = self.controller.clone();
                        let broker = self.broker.clone();
                        sessions.spawn(handle_observer(stream, controller, broker));
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept observer connection");
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!(error = %e, "observer session panicked");
                        }
                    }
                }
            }
        }

        sessions.shutdown().await;
    }

    /// Spawn [`serve`](Self::serve) on the runtime
    pub fn spawn(self, listener: UnixListener, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.serve(listener, shutdown).await })
    }
}

/// One observer session
async fn handle_observer(stream: UnixStream, controller: Arc<LifecycleController>, broker: Arc<MetricBroker>) {
    let (read_half, write_half) = stream.into_split();
    let (writer_tx, writer_rx) = mpsc::channel::<Envelope>(WRITER_BUFFER);
    let writer = tokio::spawn(run_writer(write_half, writer_rx));

    let (subscriber_id, mut metric_rx) = broker.subscribe().await;
    info!(subscriber_id, "observer connected");

    let poller_tx = writer_tx.clone();
    let poller = tokio::spawn(async move {
        while let Some(metric) = metric_rx.recv().await {
            if poller_tx.send(Envelope::metric(&metric)).await.is_err() {
                return;
            }
        }
        debug!(subscriber_id, "handle_observer: metric subscription ended");
    });

    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    loop {
        let line = match read_message(&mut reader, &mut buf).await {
            Ok(ObserverRead::Line(line)) => line,
            Ok(ObserverRead::TooLarge) => {
                warn!(subscriber_id, limit = MAX_MESSAGE_SIZE, "observer message too large");
                let _ = writer_tx.send(Envelope::read_error("message too large")).await;
                continue;
            }
            Ok(ObserverRead::Closed) => break,
            Err(e) => {
                warn!(subscriber_id, error = %e, "unable to read observer message");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let envelope = match Envelope::from_line(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(subscriber_id, error = %e, "unable to parse observer message");
                let _ = writer_tx.send(Envelope::read_error(e.to_string())).await;
                continue;
            }
        };

        debug!(subscriber_id, msg_type = ?envelope.msg_type, "handle_observer: received");
        let result = match envelope.msg_type {
            MsgType::Start => controller.start().await,
            MsgType::Stop => controller.stop().await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(subscriber_id, command = ?envelope.msg_type, error = %e, "observer command failed");
        }

        if writer_tx.send(Envelope::state(&controller.status())).await.is_err() {
            break;
        }
    }

    broker.unsubscribe(subscriber_id).await;
    poller.abort();
    drop(writer_tx);
    let _ = writer.await;
    info!(subscriber_id, "observer disconnected");
}

/// One read from an observer connection
enum ObserverRead {
    Line(String),
    /// The line exceeded [`MAX_MESSAGE_SIZE`]; the rest of it was discarded
    TooLarge,
    Closed,
}

/// Read one newline-terminated message, buffering at most `MAX_MESSAGE_SIZE + 1` bytes
async fn read_message<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<ObserverRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader).take(MAX_MESSAGE_SIZE as u64 + 1).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(ObserverRead::Closed);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > MAX_MESSAGE_SIZE {
        // Skip to the end of the oversized line in bounded chunks
        loop {
            buf.clear();
            let read = (&mut *reader).take(MAX_MESSAGE_SIZE as u64).read_until(b'\n', buf).await?;
            if read == 0 || buf.last() == Some(&b'\n') {
                break;
            }
        }
        buf.clear();
        return Ok(ObserverRead::TooLarge);
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(ObserverRead::Line(String::from_utf8_lossy(buf).into_owned()))
}

async fn run_writer(mut write_half: OwnedWriteHalf, mut writer_rx: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = writer_rx.recv().await {
        let line = match envelope.to_line() {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to serialize observer envelope");
                continue;
            }
        };
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            warn!(error = %e, "unable to send observer message");
            return;
        }
    }
    let _ = write_half.shutdown().await;
}
