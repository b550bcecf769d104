//! NDJSON over a Unix domain socket

use super::tcp::write_ndjson;
use super::{SendReport, TransportAdapter, TransportOptions};
use crate::client::TransportType;
use crate::types::QueuedMessage;
use crate::{LogBeamError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::time::timeout;

/// Unix socket connection writing newline-delimited entries
pub struct UnixTransport {
    socket_path: PathBuf,
    connect_timeout: Duration,
    stream: Option<UnixStream>,
}

impl UnixTransport {
    /// Build a transport for `options.socket_path`
    pub fn new(options: &TransportOptions) -> Self {
        Self {
            socket_path: PathBuf::from(&options.socket_path),
            connect_timeout: options.timeout,
            stream: None,
        }
    }
}

#[async_trait]
impl TransportAdapter for UnixTransport {
    fn kind(&self) -> TransportType {
        TransportType::Unix
    }

    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let conn = timeout(self.connect_timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| LogBeamError::Connection("Connection timeout".to_string()))?
            .map_err(|e| LogBeamError::Connection(format!("Failed to connect: {}", e)))?;

        self.stream = Some(conn);
        Ok(())
    }

    async fn send(&mut self, messages: &[QueuedMessage]) -> Result<SendReport> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| LogBeamError::Transport("Unix transport not connected".to_string()))?;

        if let Err(e) = write_ndjson(stream, messages).await {
            self.stream = None;
            return Err(LogBeamError::Transport(format!("Unix socket write failed: {}", e)));
        }
        Ok(SendReport::delivered())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
