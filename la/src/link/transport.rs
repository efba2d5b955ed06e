//! Frame transports for the coordinator link
//!
//! A transport is split into a [`FrameSink`] and a [`FrameStream`] so that the
//! connection can hand each half to exactly one task. [`WebSocketDialer`] is the
//! production transport; [`ChannelDialer`] is an in-memory pair for embedding
//! and tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

use super::error::LinkError;

/// Write half of a transport
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: String) -> Result<(), LinkError>;

    /// Close the transport; later writes fail
    async fn close(&mut self) -> Result<(), LinkError>;
}

/// Read half of a transport
#[async_trait]
pub trait FrameStream: Send {
    /// Next text frame, or `None` once the peer has closed
    async fn next_frame(&mut self) -> Option<Result<String, LinkError>>;
}

/// An open transport, already split into its halves
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

/// Opens transports to the controller
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Human-readable target for logs
    fn target(&self) -> String;

    async fn dial(&self) -> Result<Transport, LinkError>;
}

// === WebSocket ===

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials the controller over a websocket
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    url: String,
    timeout: Duration,
}

impl WebSocketDialer {
    /// Target `ws://{address}{path}`
    pub fn new(address: &str, path: &str, timeout: Duration) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        Self {
            url: format!("ws://{}{}", address, path),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    fn target(&self) -> String {
        self.url.clone()
    }

    async fn dial(&self) -> Result<Transport, LinkError> {
        debug!(url = %self.url, timeout = ?self.timeout, "WebSocketDialer::dial: called");
        let (stream, _response) = tokio::time::timeout(self.timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| LinkError::Transport(format!("connection timeout after {:?}", self.timeout)))?
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        info!(url = %self.url, "websocket connected");

        let (sink, stream) = stream.split();
        Ok(Transport {
            sink: Box::new(WsSink { sink }),
            stream: Box::new(WsFrames { stream }),
        })
    }
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: String) -> Result<(), LinkError> {
        self.sink
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        // Peer may already be gone; the close frame is best-effort
        let _ = self.sink.send(Message::Close(None)).await;
        self.sink.close().await.map_err(|e| LinkError::Transport(e.to_string()))
    }
}

struct WsFrames {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrames {
    async fn next_frame(&mut self) -> Option<Result<String, LinkError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Binary(data)) => {
                    debug!(len = data.len(), "WsFrames::next_frame: ignoring binary frame");
                    continue;
                }
                Err(e) => return Some(Err(LinkError::Transport(e.to_string()))),
            }
        }
    }
}

// === In-memory ===

/// The controller's side of an in-memory transport
pub struct PeerEnd {
    /// Frames sent to the agent
    pub tx: mpsc::Sender<String>,
    /// Frames written by the agent
    pub rx: mpsc::Receiver<String>,
}

impl PeerEnd {
    /// Next frame written by the agent, `None` once the agent closed its sink
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Send a frame to the agent
    pub async fn send(&self, frame: impl Into<String>) -> bool {
        self.tx.send(frame.into()).await.is_ok()
    }
}

struct ChannelSink {
    tx: Option<mpsc::Sender<String>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&mut self, frame: String) -> Result<(), LinkError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| LinkError::Transport("transport closed".to_string()))?;
        tx.send(frame)
            .await
            .map_err(|_| LinkError::Transport("peer hung up".to_string()))
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.tx = None;
        Ok(())
    }
}

struct ChannelFrames {
    rx: mpsc::Receiver<String>,
}

#[async_trait]
impl FrameStream for ChannelFrames {
    async fn next_frame(&mut self) -> Option<Result<String, LinkError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Dialer that hands out one pre-built in-memory transport
pub struct ChannelDialer {
    transport: Mutex<Option<Transport>>,
}

impl ChannelDialer {
    /// Create a dialer and the matching controller-side peer
    pub fn new(buffer: usize) -> (Self, PeerEnd) {
        let (to_agent_tx, to_agent_rx) = mpsc::channel(buffer.max(1));
        let (to_peer_tx, to_peer_rx) = mpsc::channel(buffer.max(1));
        let transport = Transport {
            sink: Box::new(ChannelSink { tx: Some(to_peer_tx) }),
            stream: Box::new(ChannelFrames { rx: to_agent_rx }),
        };
        let dialer = Self {
            transport: Mutex::new(Some(transport)),
        };
        let peer = PeerEnd {
            tx: to_agent_tx,
            rx: to_peer_rx,
        };
        (dialer, peer)
    }

    /// A dialer whose only dial attempt fails
    pub fn unreachable() -> Self {
        Self {
            transport: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Dialer for ChannelDialer {
    fn target(&self) -> String {
        "in-memory".to_string()
    }

    async fn dial(&self) -> Result<Transport, LinkError> {
        self.transport
            .lock()
            .map_err(|_| LinkError::Transport("dialer lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| LinkError::Transport("connection refused".to_string()))
    }
}
