//! NDJSON stream listeners over TCP and Unix domain sockets

use super::ServerContext;
use crate::types::ServerMessage;
use crate::Result;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, error, info, warn};

#[cfg(all(unix, feature = "unix-sockets"))]
use std::path::Path;
#[cfg(all(unix, feature = "unix-sockets"))]
use tokio::net::UnixListener;

/// Accept TCP connections until shutdown
pub async fn serve_tcp(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    info!("TCP listener on {}", listener.local_addr()?);
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let Ok(permit) = ctx.connections.clone().try_acquire_owned() else {
                            ctx.self_log.warn(format!("Rejected TCP connection from {}: connection limit reached", peer));
                            continue;
                        };
                        let _ = stream.set_nodelay(true);
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            let count = read_lines(stream, &ctx, ctx.line_limit).await;
                            debug!("TCP connection from {} closed after {} entries", peer, count);
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
    Ok(())
}

/// Bind a Unix socket listener, replacing a stale socket file
#[cfg(all(unix, feature = "unix-sockets"))]
pub fn bind_unix(path: &str) -> Result<UnixListener> {
    if Path::new(path).exists() {
        std::fs::remove_file(path)?;
    }
    UnixListener::bind(path)
        .map_err(|e| crate::LogBeamError::Server(format!("Failed to bind socket {}: {}", path, e)))
}

/// Accept Unix socket connections until shutdown, then remove the socket file
#[cfg(all(unix, feature = "unix-sockets"))]
pub async fn serve_unix(
    listener: UnixListener,
    path: String,
    ctx: Arc<ServerContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    info!("Unix socket listener on {}", path);
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let Ok(permit) = ctx.connections.clone().try_acquire_owned() else {
                            ctx.self_log.warn("Rejected Unix socket connection: connection limit reached");
                            continue;
                        };
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            read_lines(stream, &ctx, ctx.line_limit).await;
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept Unix socket connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    if let Err(e) = std::fs::remove_file(&path) {
        debug!("Could not remove socket file {}: {}", path, e);
    }
    Ok(())
}

/// Ingest newline-delimited entries from a stream; returns how many were accepted.
///
/// Lines that fail to decode are skipped, as are lines longer than `max_line`.
pub(crate) async fn read_lines<R>(stream: R, ctx: &ServerContext, max_line: usize) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(max_line));
    let mut accepted = 0;

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(tokio_util::codec::LinesCodecError::MaxLineLengthExceeded) => {
                warn!("Skipping line longer than {} bytes", max_line);
                continue;
            }
            Err(e) => {
                debug!("Stream read failed: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(entries) = ctx.ingest.decode(line) else {
            debug!("Skipping invalid line");
            continue;
        };
        let count = entries.len();
        match ctx.ingest.ingest_batch(entries) {
            ServerMessage::Ack { ack_ids } => accepted += ack_ids.len(),
            ServerMessage::Error { error_message, .. } => {
                debug!("Rejected part of {} entries: {}", count, error_message);
            }
            _ => {}
        }
    }
    accepted
}
