//! NDJSON over TCP, one entry per line

use super::{SendReport, TransportAdapter, TransportOptions};
use crate::client::TransportType;
use crate::types::QueuedMessage;
use crate::{LogBeamError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Write a batch as newline-delimited JSON and flush
pub(super) async fn write_ndjson<W>(writer: &mut W, messages: &[QueuedMessage]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    for message in messages {
        serde_json::to_writer(&mut buf, message.entry())?;
        buf.push(b'\n');
    }
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Persistent TCP connection writing newline-delimited entries
pub struct TcpTransport {
    address: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    /// Build a transport for `options.host:options.port`
    pub fn new(options: &TransportOptions) -> Self {
        Self {
            address: format!("{}:{}", options.host, options.port),
            connect_timeout: options.timeout,
            stream: None,
        }
    }
}

#[async_trait]
impl TransportAdapter for TcpTransport {
    fn kind(&self) -> TransportType {
        TransportType::Tcp
    }

    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| LogBeamError::Connection("Connection timeout".to_string()))?
            .map_err(|e| LogBeamError::Connection(format!("Failed to connect: {}", e)))?;
        stream.set_nodelay(true)?;

        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, messages: &[QueuedMessage]) -> Result<SendReport> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| LogBeamError::Transport("TCP transport not connected".to_string()))?;

        if let Err(e) = write_ndjson(stream, messages).await {
            // a failed write leaves the stream in an unknown state
            self.stream = None;
            return Err(LogBeamError::Transport(format!("TCP write failed: {}", e)));
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
