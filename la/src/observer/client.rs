//! Client for the local observer endpoint
//!
//! Used by the `start`, `stop`, `status` and `watch` subcommands.

use std::path::PathBuf;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use super::get_socket_path;
use super::messages::{Envelope, MAX_MESSAGE_SIZE, MsgType};
use crate::lifecycle::StatusSnapshot;
use crate::metrics::Metric;

/// Default timeout for connect and request/response
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ObserverClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Default for ObserverClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverClient {
    pub fn new() -> Self {
        Self::with_socket_path(get_socket_path())
    }

    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Start the workload and return the resulting state
    pub async fn start(&self) -> Result<StatusSnapshot> {
        debug!("ObserverClient::start: called");
        self.command(MsgType::Start).await
    }

    /// Stop the workload and return the resulting state
    pub async fn stop(&self) -> Result<StatusSnapshot> {
        debug!("ObserverClient::stop: called");
        self.command(MsgType::Stop).await
    }

    /// Current state without changing anything
    pub async fn status(&self) -> Result<StatusSnapshot> {
        debug!("ObserverClient::status: called");
        self.command(MsgType::State).await
    }

    /// Stream metrics to `on_metric` until `count` have arrived or the endpoint hangs up
    ///
    /// Returns the number of metrics delivered.
    pub async fn watch<F>(&self, count: Option<usize>, mut on_metric: F) -> Result<usize>
    where
        F: FnMut(Metric),
    {
        debug!(?count, "ObserverClient::watch: called");
        let (mut lines, _write_half) = self.connect().await?;
        let mut seen = 0;

        while count.is_none_or(|limit| seen < limit) {
            let Some(line) = lines.next_line().await.context("Failed to read from observer socket")? else {
                break;
            };
            let envelope = Envelope::from_line(&line).context("Failed to parse observer envelope")?;
            if let Some(metric) = envelope.as_metric() {
                on_metric(metric);
                seen += 1;
            }
        }
        Ok(seen)
    }

    async fn connect(&self) -> Result<(Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf)> {
        debug!(?self.socket_path, "ObserverClient::connect: called");
        let stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to observer socket")?;
        let (read_half, write_half) = stream.into_split();
        Ok((BufReader::new(read_half).lines(), write_half))
    }

    /// Send one command and wait for the state that answers it
    async fn command(&self, msg_type: MsgType) -> Result<StatusSnapshot> {
        let (mut lines, mut write_half) = self.connect().await?;
        let line = Envelope::command(msg_type)
            .to_line()
            .context("Failed to serialize command")?;

        tokio::time::timeout(self.timeout, async {
            write_half
                .write_all(line.as_bytes())
                .await
                .context("Failed to write command")?;
            write_half.flush().await.context("Failed to flush stream")?;
            Ok::<_, eyre::Error>(())
        })
        .await
        .context("Write timeout")??;

        // Metric envelopes may precede the state reply
        let status = tokio::time::timeout(self.timeout, async {
            loop {
                let line = lines
                    .next_line()
                    .await
                    .context("Failed to read response")?
                    .ok_or_else(|| eyre::eyre!("Observer endpoint closed the connection"))?;
                if line.len() > MAX_MESSAGE_SIZE {
                    return Err(eyre::eyre!("Response too large: {} bytes", line.len()));
                }
                let envelope = Envelope::from_line(&line).context("Failed to parse observer envelope")?;
                match envelope.msg_type {
                    MsgType::State => {
                        return envelope
                            .as_status()
                            .ok_or_else(|| eyre::eyre!("Malformed state envelope"));
                    }
                    MsgType::ReadError => {
                        return Err(eyre::eyre!("Observer endpoint error: {}", envelope.data));
                    }
                    _ => continue,
                }
            }
        })
        .await
        .context("Read timeout")??;

        debug!(?status, "ObserverClient::command: received state");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    #[test]
    fn test_client_default_path() {
        let client = ObserverClient::default();
        assert!(client.socket_path().ends_with("observer.sock"));
    }

    #[test]
    fn test_client_with_timeout() {
        let client = ObserverClient::with_socket_path(PathBuf::from("/tmp/x.sock")).with_timeout(Duration::from_secs(9));
        assert_eq!(client.timeout, Duration::from_secs(9));
        assert!(!client.socket_exists());
    }

    #[tokio::test]
    async fn test_connect_missing_socket_fails() {
        let temp = TempDir::new().unwrap();
        let client = ObserverClient::with_socket_path(temp.path().join("missing.sock"));
        assert!(client.status().await.is_err());
    }

    #[tokio::test]
    async fn test_command_skips_metrics_until_state() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("observer.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let mock = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let request = Envelope::from_line(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(request.msg_type, MsgType::Stop);

            let metric = Envelope::metric(&Metric::counter(crate::metrics::MetricKind::IncFailedTx));
            write_half.write_all(metric.to_line().unwrap().as_bytes()).await.unwrap();
            let state = Envelope::state(&StatusSnapshot {
                config_hash: Some("ff".to_string()),
                running: false,
            });
            write_half.write_all(state.to_line().unwrap().as_bytes()).await.unwrap();
        });

        let client = ObserverClient::with_socket_path(socket_path);
        let status = client.stop().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.config_hash.as_deref(), Some("ff"));
        mock.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_error_is_surfaced() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("observer.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let mock = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            lines.next_line().await.unwrap();
            let line = Envelope::read_error("nope").to_line().unwrap();
            write_half.write_all(line.as_bytes()).await.unwrap();
        });

        let client = ObserverClient::with_socket_path(socket_path);
        let err = client.start().await.unwrap_err();
        assert!(err.to_string().contains("nope"));
        mock.await.unwrap();
    }
}
