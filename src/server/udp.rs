//! UDP listener: one JSON entry per datagram

use super::ServerContext;
use crate::types::ServerMessage;
use crate::Result;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Largest payload a UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Receive datagrams until shutdown.
///
/// Undecodable datagrams are dropped; UDP has no reply channel.
pub async fn serve_udp(
    socket: UdpSocket,
    ctx: Arc<ServerContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    info!("UDP listener on {}", socket.local_addr()?);
    let mut buf = vec![0u8; ctx.line_limit.clamp(1, MAX_DATAGRAM_SIZE)];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((amt, src)) => handle_datagram(&ctx, &buf[..amt], src),
                    Err(e) => error!("Failed to receive datagram: {}", e),
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
    Ok(())
}

fn handle_datagram(ctx: &ServerContext, payload: &[u8], src: std::net::SocketAddr) {
    let Ok(text) = std::str::from_utf8(payload) else {
        debug!("Dropping non-UTF-8 datagram from {}", src);
        return;
    };
    let entries = match ctx.ingest.decode(text.trim()) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Dropping invalid datagram from {}: {}", src, e);
            return;
        }
    };
    if let ServerMessage::Error { error_message, .. } = ctx.ingest.ingest_batch(entries) {
        debug!("Datagram from {} rejected: {}", src, error_message);
    }
}
