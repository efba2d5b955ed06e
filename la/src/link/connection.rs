//! A live connection: one reader task, one writer task, and the queues between them
//!
//! Nothing outside this module touches the transport. Callers enqueue
//! [`AgentMessage`]s through a [`ConnectionSender`] and drain decoded
//! [`ControllerMessage`]s from the inbound receiver.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::LinkError;
use super::messages::{AgentMessage, ControllerMessage};
use super::transport::{FrameSink, FrameStream, Transport};

/// How long a graceful close may take before the transport is forced shut
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// How long `finish` waits for the writer task after closing
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on the transport's own close handshake
const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Items on the outbound queue
#[derive(Debug)]
enum Outbound {
    Message(AgentMessage),
    Close,
}

/// Cloneable handle for enqueueing outbound messages
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    tx: mpsc::Sender<Outbound>,
    /// Flipped once the transport is closed, or to force it closed
    closed: Arc<watch::Sender<bool>>,
}

impl ConnectionSender {
    /// Queue a message for the writer
    pub async fn send(&self, msg: AgentMessage) -> Result<(), LinkError> {
        let kind = msg.kind();
        self.tx
            .send(Outbound::Message(msg))
            .await
            .map_err(|_| LinkError::Transport(format!("connection closed, dropped {}", kind)))
    }

    /// Queue a message, giving up if the queue stays full for `wait`
    pub async fn send_within(&self, msg: AgentMessage, wait: Duration) -> Result<(), LinkError> {
        let kind = msg.kind();
        self.tx
            .send_timeout(Outbound::Message(msg), wait)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => LinkError::Transport(format!("outbound queue full, dropped {}", kind)),
                SendTimeoutError::Closed(_) => LinkError::Transport(format!("connection closed, dropped {}", kind)),
            })
    }

    /// Close the transport after everything queued so far
    ///
    /// Forces the transport shut if the writer has not finished within
    /// [`CLOSE_GRACE`], which happens when the peer stops reading.
    pub async fn close(&self) {
        debug!("ConnectionSender::close: called");
        let graceful = async {
            // Writer already gone means the transport is already closing
            let _ = self.tx.send(Outbound::Close).await;
            let mut closed = self.closed.subscribe();
            let _ = closed.wait_for(|closed| *closed).await;
        };
        if tokio::time::timeout(CLOSE_GRACE, graceful).await.is_err() {
            warn!("connection did not close in time; forcing transport shut");
            self.abort();
        }
    }

    /// Drop the transport now, abandoning queued and in-flight frames
    pub fn abort(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Owner of the reader and writer tasks for one transport
pub struct Connection {
    sender: ConnectionSender,
    inbound: Option<mpsc::Receiver<ControllerMessage>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Split `transport` and spawn its reader and writer
    pub fn spawn(transport: Transport, outbound_buffer: usize, inbound_buffer: usize) -> Self {
        debug!(outbound_buffer, inbound_buffer, "Connection::spawn: called");
        let (out_tx, out_rx) = mpsc::channel(outbound_buffer.max(1));
        let (in_tx, in_rx) = mpsc::channel(inbound_buffer.max(1));
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed = Arc::new(closed_tx);

        let Transport { sink, stream } = transport;
        let writer = tokio::spawn(run_writer(sink, out_rx, closed.clone()));
        let reader = tokio::spawn(run_reader(stream, in_tx, closed_rx));

        Self {
            sender: ConnectionSender { tx: out_tx, closed },
            inbound: Some(in_rx),
            reader,
            writer,
        }
    }

    pub fn sender(&self) -> ConnectionSender {
        self.sender.clone()
    }

    /// Take the inbound queue; it closes when the reader ends
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<ControllerMessage>> {
        self.inbound.take()
    }

    /// Close the transport and wait for both tasks to end
    pub async fn finish(self) {
        debug!("Connection::finish: called");
        self.sender.close().await;

        let writer_abort = self.writer.abort_handle();
        match tokio::time::timeout(WRITER_FLUSH_TIMEOUT, self.writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => error!(error = %e, "connection writer panicked"),
            Err(_) => {
                warn!("connection writer did not flush in time; aborting");
                writer_abort.abort();
            }
        }
        self.sender.abort();
        drop(self.sender);

        self.reader.abort();
        let _ = self.reader.await;
    }
}

async fn run_writer(mut sink: Box<dyn FrameSink>, mut out_rx: mpsc::Receiver<Outbound>, closed: Arc<watch::Sender<bool>>) {
    debug!("run_writer: started");
    let mut aborted = closed.subscribe();
    loop {
        let item = tokio::select! {
            biased;
            _ = aborted.wait_for(|closed| *closed) => {
                debug!("run_writer: transport forced shut");
                break;
            }
            item = out_rx.recv() => item,
        };
        let Some(item) = item else {
            break;
        };
        let msg = match item {
            Outbound::Message(msg) => msg,
            Outbound::Close => {
                debug!("run_writer: close requested");
                break;
            }
        };

        let frame = match msg.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(kind = msg.kind(), error = %e, "failed to serialize outbound message");
                continue;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = aborted.wait_for(|closed| *closed) => {
                warn!(kind = msg.kind(), "transport forced shut mid-write");
                break;
            }
            sent = sink.send_frame(frame) => sent,
        };
        if let Err(e) = sent {
            warn!(kind = msg.kind(), error = %e, "write failed; closing connection");
            break;
        }
        debug!(kind = msg.kind(), "run_writer: sent");
    }

    match tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "run_writer: close failed"),
        Err(_) => debug!("run_writer: close handshake timed out"),
    }
    closed.send_replace(true);
    info!("connection writer stopped");
}

async fn run_reader(
    mut stream: Box<dyn FrameStream>,
    in_tx: mpsc::Sender<ControllerMessage>,
    mut closed_rx: watch::Receiver<bool>,
) {
    debug!("run_reader: started");
    loop {
        let next = tokio::select! {
            _ = closed_rx.wait_for(|closed| *closed) => {
                debug!("run_reader: writer closed the transport");
                break;
            }
            next = stream.next_frame() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(error = %e, "read failed; closing connection");
                break;
            }
            None => {
                info!("controller closed the connection");
                break;
            }
        };

        let msg = match ControllerMessage::from_frame(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping connection after undecodable frame");
                break;
            }
        };

        let forwarded = tokio::select! {
            _ = closed_rx.wait_for(|closed| *closed) => {
                debug!("run_reader: transport closed with inbound queue full");
                break;
            }
            forwarded = in_tx.send(msg) => forwarded,
        };
        if forwarded.is_err() {
            debug!("run_reader: inbound queue dropped");
            break;
        }
    }
    // Dropping in_tx closes the inbound queue
    info!("connection reader stopped");
}
