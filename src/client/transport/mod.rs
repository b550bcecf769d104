//! Pluggable client transports
//!
//! Every protocol implements [`TransportAdapter`]. [`create_transport`] picks
//! and connects one from [`TransportOptions`]; `auto` tries WebSocket and
//! falls back to HTTP once.

mod http;
mod tcp;
mod udp;
#[cfg(all(unix, feature = "unix-sockets"))]
mod unix;
mod ws;

pub use http::HttpTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;
#[cfg(all(unix, feature = "unix-sockets"))]
pub use unix::UnixTransport;
pub use ws::WsTransport;

use crate::client::TransportType;
use crate::config::ClientConfig;
use crate::types::{QueuedMessage, RpcDescriptor, ServerMessage};
use crate::{LogBeamError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Callback invoked for every message the server pushes to the client
pub type MessageHandler = Arc<dyn Fn(ServerMessage) + Send + Sync>;

/// What the server did with a batch that reached it.
///
/// Ids in neither list were stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Refused for now, e.g. rate limited; worth sending again
    pub retry: Vec<String>,
    /// Refused for good, e.g. failed validation
    pub rejected: Vec<String>,
}

impl SendReport {
    /// Every entry was stored, or the protocol cannot tell
    pub fn delivered() -> Self {
        Self::default()
    }

    /// Whether nothing was refused
    pub fn is_clean(&self) -> bool {
        self.retry.is_empty() && self.rejected.is_empty()
    }
}

/// A connection to the collector
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Protocol implemented by this adapter
    fn kind(&self) -> TransportType;

    /// Establish the connection; calling it again while connected is a no-op
    async fn connect(&mut self) -> Result<()>;

    /// Put a batch on the wire.
    ///
    /// `Err` means the batch may not have arrived at all.
    async fn send(&mut self, messages: &[QueuedMessage]) -> Result<SendReport>;

    /// Publish the RPC handlers this client exposes.
    ///
    /// Protocols without server push have nothing to publish to.
    async fn publish_tools(&mut self, _tools: &[RpcDescriptor]) -> Result<()> {
        Ok(())
    }

    /// Register the server-push handler.
    ///
    /// Returns `false` when the protocol cannot carry server push.
    fn on_message(&mut self, _handler: MessageHandler) -> bool {
        false
    }

    /// Close the connection
    async fn close(&mut self) -> Result<()>;

    /// Whether `send` can currently succeed
    fn is_connected(&self) -> bool;
}

/// Everything a transport needs to reach the server
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Requested transport
    pub kind: TransportType,
    /// WebSocket or HTTP URL
    pub url: String,
    /// Host for TCP/UDP
    pub host: String,
    /// Port for TCP
    pub port: u16,
    /// Port for UDP
    pub udp_port: u16,
    /// Unix socket path
    pub socket_path: String,
    /// Session announced in the WebSocket handshake
    pub session_id: String,
    /// Connect timeout
    pub timeout: Duration,
}

impl TransportOptions {
    /// Build options from a client configuration
    pub fn from_config(config: &ClientConfig, session_id: impl Into<String>) -> Self {
        Self {
            kind: config.transport,
            url: config.url.clone(),
            host: config.host.clone(),
            port: config.port,
            udp_port: config.udp_port,
            socket_path: config.socket_path.clone(),
            session_id: session_id.into(),
            timeout: Duration::from_secs(config.timeout_seconds),
        }
    }
}

/// Rewrite a WebSocket URL to its HTTP equivalent (`ws→http`, `wss→https`)
pub fn http_url_for(url: &str) -> Result<String> {
    let mut parsed = Url::parse(url)
        .map_err(|e| LogBeamError::Config(format!("Invalid server URL {}: {}", url, e)))?;
    let scheme = match parsed.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return Ok(parsed.to_string()),
    };
    parsed
        .set_scheme(scheme)
        .map_err(|_| LogBeamError::Config(format!("Cannot rewrite scheme of {}", url)))?;
    Ok(parsed.to_string())
}

/// Create and connect the transport selected by `options`
pub async fn create_transport(options: &TransportOptions) -> Result<Box<dyn TransportAdapter>> {
    let mut transport: Box<dyn TransportAdapter> = match options.kind {
        TransportType::Auto => {
            let primary = Box::new(WsTransport::new(options)?);
            let mut http_options = options.clone();
            http_options.url = http_url_for(&options.url)?;
            let fallback = Box::new(HttpTransport::new(&http_options)?);
            return connect_with_fallback(primary, fallback).await;
        }
        TransportType::Ws => Box::new(WsTransport::new(options)?),
        TransportType::Http => Box::new(HttpTransport::new(options)?),
        TransportType::Tcp => Box::new(TcpTransport::new(options)),
        TransportType::Udp => Box::new(UdpTransport::new(options)),
        #[cfg(all(unix, feature = "unix-sockets"))]
        TransportType::Unix => Box::new(UnixTransport::new(options)),
        #[cfg(not(all(unix, feature = "unix-sockets")))]
        TransportType::Unix => {
            return Err(LogBeamError::Config(
                "Unix socket transport is not available on this build".to_string(),
            ))
        }
    };

    transport.connect().await?;
    info!("Connected using {} transport", transport.kind());
    Ok(transport)
}

/// Connect `primary`, or `fallback` if that fails.
///
/// Each adapter gets exactly one attempt.
pub async fn connect_with_fallback(
    mut primary: Box<dyn TransportAdapter>,
    mut fallback: Box<dyn TransportAdapter>,
) -> Result<Box<dyn TransportAdapter>> {
    match primary.connect().await {
        Ok(()) => {
            info!("Connected using {} transport", primary.kind());
            Ok(primary)
        }
        Err(primary_err) => {
            warn!(
                "{} transport failed ({}), falling back to {}",
                primary.kind(),
                primary_err,
                fallback.kind()
            );
            match fallback.connect().await {
                Ok(()) => {
                    info!("Connected using {} transport", fallback.kind());
                    Ok(fallback)
                }
                Err(fallback_err) => Err(LogBeamError::Connection(format!(
                    "{}: {}; {}: {}",
                    primary.kind(),
                    primary_err,
                    fallback.kind(),
                    fallback_err
                ))),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory transport recording every batch it is given
    #[derive(Clone, Default)]
    pub struct MockTransport {
        pub connect_attempts: Arc<AtomicUsize>,
        pub sent: Arc<Mutex<Vec<Vec<QueuedMessage>>>>,
        pub fail_connect: bool,
        pub fail_send: Arc<std::sync::atomic::AtomicBool>,
        pub connected: Arc<std::sync::atomic::AtomicBool>,
        pub handler: Arc<Mutex<Option<MessageHandler>>>,
        pub published: Arc<Mutex<Vec<Vec<RpcDescriptor>>>>,
        pub report: Arc<Mutex<SendReport>>,
    }

    impl MockTransport {
        pub fn connected() -> Self {
            let mock = Self::default();
            mock.connected.store(true, Ordering::SeqCst);
            mock
        }

        pub fn failing_connect() -> Self {
            Self {
                fail_connect: true,
                ..Default::default()
            }
        }

        pub fn sent_ids(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .flatten()
                .map(|m| m.entry().id.clone())
                .collect()
        }

        /// Deliver a server message to the registered handler
        pub fn push(&self, message: ServerMessage) {
            let handler = self.handler.lock().clone();
            if let Some(handler) = handler {
                handler(message);
            }
        }
    }

    #[async_trait]
    impl TransportAdapter for MockTransport {
        fn kind(&self) -> TransportType {
            TransportType::Ws
        }

        async fn connect(&mut self) -> Result<()> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                return Err(LogBeamError::Connection("refused".to_string()));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&mut self, messages: &[QueuedMessage]) -> Result<SendReport> {
            if !self.is_connected() {
                return Err(LogBeamError::Transport("not connected".to_string()));
            }
            if self.fail_send.load(Ordering::SeqCst) {
                return Err(LogBeamError::Transport("broken pipe".to_string()));
            }
            self.sent.lock().push(messages.to_vec());
            Ok(std::mem::take(&mut *self.report.lock()))
        }

        async fn publish_tools(&mut self, tools: &[RpcDescriptor]) -> Result<()> {
            if !self.is_connected() {
                return Err(LogBeamError::Transport("not connected".to_string()));
            }
            self.published.lock().push(tools.to_vec());
            Ok(())
        }

        fn on_message(&mut self, handler: MessageHandler) -> bool {
            *self.handler.lock() = Some(handler);
            true
        }

        async fn close(&mut self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use std::sync::atomic::Ordering;

    fn options(kind: TransportType, url: &str) -> TransportOptions {
        TransportOptions {
            kind,
            url: url.to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            udp_port: 1,
            socket_path: "/nonexistent/logbeam.sock".to_string(),
            session_id: "s-1".to_string(),
            timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_http_url_rewrite() {
        assert_eq!(
            http_url_for("ws://localhost:8080/api/v1/stream").unwrap(),
            "http://localhost:8080/api/v1/stream"
        );
        assert_eq!(
            http_url_for("wss://logs.example.com/api/v1/stream").unwrap(),
            "https://logs.example.com/api/v1/stream"
        );
        assert_eq!(
            http_url_for("http://localhost:8080/").unwrap(),
            "http://localhost:8080/"
        );
        assert!(http_url_for("not a url").is_err());
    }

    #[tokio::test]
    async fn test_fallback_used_once_when_primary_fails() {
        let primary = MockTransport::failing_connect();
        let fallback = MockTransport::default();
        let primary_attempts = primary.connect_attempts.clone();
        let fallback_attempts = fallback.connect_attempts.clone();

        let transport = connect_with_fallback(Box::new(primary), Box::new(fallback))
            .await
            .unwrap();

        assert!(transport.is_connected());
        assert_eq!(primary_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_not_tried_when_primary_connects() {
        let primary = MockTransport::default();
        let fallback = MockTransport::default();
        let fallback_attempts = fallback.connect_attempts.clone();

        connect_with_fallback(Box::new(primary), Box::new(fallback))
            .await
            .unwrap();
        assert_eq!(fallback_attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_both_failing_reports_connection_error() {
        let primary = MockTransport::failing_connect();
        let fallback = MockTransport::failing_connect();
        let fallback_attempts = fallback.connect_attempts.clone();

        let result = connect_with_fallback(Box::new(primary), Box::new(fallback)).await;
        assert!(matches!(result, Err(LogBeamError::Connection(_))));
        // no cascading beyond the single fallback
        assert_eq!(fallback_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auto_falls_back_to_http() {
        // nothing listens on port 1, so the WebSocket handshake fails
        let transport = create_transport(&options(
            TransportType::Auto,
            "ws://127.0.0.1:1/api/v1/stream",
        ))
        .await
        .unwrap();

        assert_eq!(transport.kind(), TransportType::Http);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_explicit_tcp_reports_connection_error() {
        let result = create_transport(&options(TransportType::Tcp, "")).await;
        assert!(matches!(result, Err(LogBeamError::Connection(_))));
    }
}
