//! Persistent bidirectional WebSocket transport

use super::{MessageHandler, SendReport, TransportAdapter, TransportOptions};
use crate::client::TransportType;
use crate::types::{ClientControl, LogEntry, QueuedMessage, RpcDescriptor, ServerMessage};
use crate::{LogBeamError, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Sends each batch as one JSON-array text frame and dispatches server push
pub struct WsTransport {
    url: String,
    session_id: String,
    connect_timeout: Duration,
    sink: Option<WsSink>,
    reader: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    handler: Arc<Mutex<Option<MessageHandler>>>,
}

impl WsTransport {
    /// Build a transport for `options.url`
    pub fn new(options: &TransportOptions) -> Result<Self> {
        if options.url.is_empty() {
            return Err(LogBeamError::Config("WebSocket URL cannot be empty".to_string()));
        }
        Ok(Self {
            url: options.url.clone(),
            session_id: options.session_id.clone(),
            connect_timeout: options.timeout,
            sink: None,
            reader: None,
            connected: Arc::new(AtomicBool::new(false)),
            handler: Arc::new(Mutex::new(None)),
        })
    }

    fn dispatch(handler: &Mutex<Option<MessageHandler>>, text: &str) {
        let messages = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => vec![message],
            Err(_) => match serde_json::from_str::<Vec<ServerMessage>>(text) {
                Ok(messages) => messages,
                Err(e) => {
                    debug!("Ignoring undecodable server frame: {}", e);
                    return;
                }
            },
        };

        let handler = handler.lock().clone();
        if let Some(handler) = handler {
            for message in messages {
                handler(message);
            }
        }
    }
}

#[async_trait]
impl TransportAdapter for WsTransport {
    fn kind(&self) -> TransportType {
        TransportType::Ws
    }

    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| LogBeamError::Connection(format!("Invalid WebSocket URL: {}", e)))?;
        let session_header = HeaderValue::from_str(&self.session_id)
            .map_err(|e| LogBeamError::Connection(format!("Invalid session id header: {}", e)))?;
        request
            .headers_mut()
            .insert("x-logger-role", HeaderValue::from_static("client"));
        request.headers_mut().insert("x-session-id", session_header);

        let (stream, _) = timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| LogBeamError::Connection("Connection timeout".to_string()))?
            .map_err(|e| LogBeamError::Connection(format!("Failed to connect: {}", e)))?;

        let (sink, mut read) = stream.split();
        let connected = self.connected.clone();
        let handler = self.handler.clone();
        connected.store(true, Ordering::SeqCst);

        self.reader = Some(tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => Self::dispatch(&handler, text.as_str()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            debug!("WebSocket reader finished");
        }));
        self.sink = Some(sink);
        Ok(())
    }

    async fn send(&mut self, messages: &[QueuedMessage]) -> Result<SendReport> {
        if !self.is_connected() {
            return Err(LogBeamError::Transport("WebSocket not connected".to_string()));
        }
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| LogBeamError::Transport("WebSocket not connected".to_string()))?;

        let entries: Vec<&LogEntry> = messages.iter().map(QueuedMessage::entry).collect();
        let frame = serde_json::to_string(&entries)?;
        if let Err(e) = sink.send(Message::text(frame)).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(LogBeamError::Transport(format!("WebSocket send failed: {}", e)));
        }
        Ok(SendReport::delivered())
    }

    async fn publish_tools(&mut self, tools: &[RpcDescriptor]) -> Result<()> {
        let sink = match self.sink.as_mut() {
            Some(sink) if self.connected.load(Ordering::SeqCst) => sink,
            _ => return Err(LogBeamError::Transport("WebSocket not connected".to_string())),
        };

        let frame = serde_json::to_string(&ClientControl::RegisterTools {
            session_id: Some(self.session_id.clone()),
            tools: tools.to_vec(),
        })?;
        if let Err(e) = sink.send(Message::text(frame)).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(LogBeamError::Transport(format!("WebSocket send failed: {}", e)));
        }
        debug!("Published {} RPC handlers", tools.len());
        Ok(())
    }

    fn on_message(&mut self, handler: MessageHandler) -> bool {
        *self.handler.lock() = Some(handler);
        true
    }

    async fn close(&mut self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.close().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
