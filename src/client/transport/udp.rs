//! Fire-and-forget UDP, one JSON datagram per entry

use super::{SendReport, TransportAdapter, TransportOptions};
use crate::client::TransportType;
use crate::types::QueuedMessage;
use crate::{LogBeamError, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

/// Largest payload a single IPv4 UDP datagram can carry
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Connected UDP socket sending one datagram per entry
pub struct UdpTransport {
    address: String,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    /// Build a transport for `options.host:options.udp_port`
    pub fn new(options: &TransportOptions) -> Self {
        Self {
            address: format!("{}:{}", options.host, options.udp_port),
            socket: None,
        }
    }
}

#[async_trait]
impl TransportAdapter for UdpTransport {
    fn kind(&self) -> TransportType {
        TransportType::Udp
    }

    async fn connect(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| LogBeamError::Connection(format!("Failed to bind UDP socket: {}", e)))?;
        socket
            .connect(&self.address)
            .await
            .map_err(|e| LogBeamError::Connection(format!("Failed to connect: {}", e)))?;

        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, messages: &[QueuedMessage]) -> Result<SendReport> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| LogBeamError::Transport("UDP transport not connected".to_string()))?;

        for message in messages {
            let datagram = serde_json::to_vec(message.entry())?;
            if datagram.len() > MAX_DATAGRAM_SIZE {
                debug!(
                    "Dropping entry {} ({} bytes exceeds datagram limit)",
                    message.entry().id,
                    datagram.len()
                );
                continue;
            }
            socket
                .send(&datagram)
                .await
                .map_err(|e| LogBeamError::Transport(format!("UDP send failed: {}", e)))?;
        }
        Ok(SendReport::delivered())
    }

    async fn close(&mut self) -> Result<()> {
        self.socket = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }
}
