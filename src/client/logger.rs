//! logbeam client for sending structured entries to the collector

use super::queue::LogQueue;
use super::rpc::{RpcHandler, RpcRegistry};
use super::session::{self, dispatch_rpc, drain_queue, DrainBackoff, DrainOutcome};
use super::transport::{create_transport, MessageHandler, TransportAdapter, TransportOptions};
use crate::config::ClientConfig;
use crate::types::{
    ApplicationInfo, EntryType, ExceptionData, GroupAction, ImageData, LogEntry, QueuedMessage,
    ServerMessage, Severity, StackFrame, Tags,
};
use crate::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

/// Structured logger that queues entries and ships them in the background.
///
/// Logging methods never fail and never block on the network: entries go
/// into a bounded queue that a drain task sends every `drain_interval_ms`.
/// Cloning a `Logger` shares the same queue, session and transport.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    config: ClientConfig,
    session_id: String,
    application: ApplicationInfo,
    hostname: String,
    options: TransportOptions,
    queue: Mutex<LogQueue>,
    transport: tokio::sync::Mutex<Option<Box<dyn TransportAdapter>>>,
    message_handler: MessageHandler,
    rpc: RpcRegistry,
    backoff: Mutex<DrainBackoff>,
    session_started: AtomicBool,
    tools_dirty: AtomicBool,
    section: Mutex<Option<String>>,
    groups: Mutex<Vec<String>>,
    shutdown_tx: broadcast::Sender<()>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl Logger {
    /// Create a logger and connect using the configured transport.
    ///
    /// A failed connection is not an error: entries accumulate in the queue
    /// and the drain task keeps retrying with backoff.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let session_id = session_id_for(&config);
        let options = TransportOptions::from_config(&config, session_id.clone());

        let transport = match create_transport(&options).await {
            Ok(transport) => Some(transport),
            Err(e) => {
                warn!("logbeam transport unavailable, queueing entries: {}", e);
                None
            }
        };

        Self::build(config, session_id, options, transport)
    }

    /// Create a logger on top of an already constructed transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_transport(config: ClientConfig, transport: Box<dyn TransportAdapter>) -> Result<Self> {
        config.validate()?;
        let session_id = session_id_for(&config);
        let options = TransportOptions::from_config(&config, session_id.clone());
        Self::build(config, session_id, options, Some(transport))
    }

    fn build(
        config: ClientConfig,
        session_id: String,
        options: TransportOptions,
        mut transport: Option<Box<dyn TransportAdapter>>,
    ) -> Result<Self> {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let application = ApplicationInfo {
            name: config.app.clone(),
            version: config.version.clone(),
            environment: Some(config.environment.clone()),
        };
        let (shutdown_tx, _) = broadcast::channel(1);

        let inner = Arc::new_cyclic(|weak: &Weak<LoggerInner>| {
            let message_handler = rpc_request_handler(weak.clone());
            if let Some(transport) = transport.as_mut() {
                if !transport.on_message(message_handler.clone()) {
                    debug!("{} transport has no server push, RPC disabled", transport.kind());
                }
            }

            LoggerInner {
                queue: Mutex::new(LogQueue::new(config.max_queue_bytes)),
                transport: tokio::sync::Mutex::new(transport),
                message_handler,
                rpc: RpcRegistry::new(),
                backoff: Mutex::new(DrainBackoff::new()),
                session_started: AtomicBool::new(false),
                tools_dirty: AtomicBool::new(true),
                section: Mutex::new(None),
                groups: Mutex::new(Vec::new()),
                shutdown_tx,
                drain_task: Mutex::new(None),
                config,
                session_id,
                application,
                hostname,
                options,
            }
        });

        let task = tokio::spawn(drain_loop(Arc::downgrade(&inner), inner.shutdown_tx.subscribe()));
        *inner.drain_task.lock() = Some(task);

        Ok(Self { inner })
    }

    /// Session identifier used for every entry
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Number of entries waiting to be sent
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Log a debug message
    pub fn debug(&self, message: impl Into<String>) {
        self.log(Severity::Debug, message, None);
    }

    /// Log an info message
    pub fn info(&self, message: impl Into<String>) {
        self.log(Severity::Info, message, None);
    }

    /// Log a warning message
    pub fn warn(&self, message: impl Into<String>) {
        self.log(Severity::Warning, message, None);
    }

    /// Log an error message
    pub fn error(&self, message: impl Into<String>) {
        self.log(Severity::Error, message, None);
    }

    /// Log a critical message
    pub fn critical(&self, message: impl Into<String>) {
        self.log(Severity::Critical, message, None);
    }

    /// Log a text message with optional tags
    pub fn log(&self, severity: Severity, message: impl Into<String>, tags: Option<Tags>) {
        let mut entry = self.inner.base(severity, EntryType::Text);
        entry.text = Some(message.into());
        if let Some(tags) = tags {
            entry = entry.with_tags(tags);
        }
        self.inner.enqueue(QueuedMessage::Event(entry));
    }

    /// Log an error together with its `source()` chain and caller-supplied frames
    pub fn exception(&self, err: &(dyn std::error::Error + 'static), frames: Vec<StackFrame>) {
        let mut exception = ExceptionData::from_error(err);
        exception.stack_trace = frames;

        let mut entry = self.inner.base(Severity::Error, EntryType::Exception);
        entry.text = Some(exception.message.clone());
        entry.exception = Some(exception);
        self.inner.enqueue(QueuedMessage::Event(entry));
    }

    /// Log a labelled JSON value
    pub fn json(&self, label: impl Into<String>, value: Value) {
        let mut entry = self.inner.base(Severity::Info, EntryType::Text);
        entry.text = Some(label.into());
        entry.json = Some(value);
        self.inner.enqueue(QueuedMessage::Event(entry));
    }

    /// Upsert a state key; `Value::Null` deletes it on the server
    pub fn state(&self, key: impl Into<String>, value: Value) {
        let mut entry = self.inner.base(Severity::Info, EntryType::State);
        entry.state_key = Some(key.into());
        entry.state_value = Some(value);
        self.inner.enqueue(QueuedMessage::Event(entry));
    }

    /// Log an image from raw bytes
    pub fn image(&self, bytes: &[u8], mime_type: impl Into<String>, label: Option<String>) {
        let mut entry = self.inner.base(Severity::Info, EntryType::Image);
        entry.image = Some(ImageData {
            data: Some(STANDARD.encode(bytes)),
            reference: None,
            mime_type: Some(mime_type.into()),
            label,
            width: None,
            height: None,
        });
        self.inner.enqueue(QueuedMessage::Event(entry));
    }

    /// Open a group; entries logged until `group_end` belong to it
    pub fn group(&self, label: impl Into<String>) -> String {
        let group_id = Uuid::new_v4().to_string();
        let mut entry = self.inner.base(Severity::Info, EntryType::Group);
        entry.group_id = Some(group_id.clone());
        entry.group_action = Some(GroupAction::Open);
        entry.group_label = Some(label.into());

        self.inner.groups.lock().push(group_id.clone());
        self.inner.enqueue(QueuedMessage::Event(entry));
        group_id
    }

    /// Close the innermost open group
    pub fn group_end(&self) {
        let Some(group_id) = self.inner.groups.lock().pop() else {
            return;
        };
        let mut entry = self.inner.base(Severity::Info, EntryType::Group);
        entry.group_id = Some(group_id);
        entry.group_action = Some(GroupAction::Close);
        self.inner.enqueue(QueuedMessage::Event(entry));
    }

    /// Set the section for subsequent entries; `None` clears it
    pub fn section(&self, name: Option<&str>) {
        *self.inner.section.lock() = name.map(str::to_string);
    }

    /// Explicitly start the session with extra metadata.
    ///
    /// A no-op if the session already started, which happens implicitly on
    /// the first logged entry.
    pub fn session_start(&self, metadata: Tags) {
        self.inner.start_session(Some(metadata));
    }

    /// Announce the end of the session
    pub fn session_end(&self) {
        let end = session::session_end(&self.inner.session_id, self.inner.application.clone());
        self.inner.push(end);
    }

    /// Expose an RPC handler to viewers.
    ///
    /// The updated handler list is published on the next drain.
    pub fn register_rpc(&self, method: impl Into<String>, handler: RpcHandler) {
        self.inner.rpc.register(method, handler);
        self.inner.tools_dirty.store(true, Ordering::SeqCst);
    }

    /// Remove an RPC handler
    pub fn unregister_rpc(&self, method: &str) -> bool {
        let removed = self.inner.rpc.unregister(method);
        if removed {
            self.inner.tools_dirty.store(true, Ordering::SeqCst);
        }
        removed
    }

    /// Registered RPC handlers
    pub fn rpc_registry(&self) -> &RpcRegistry {
        &self.inner.rpc
    }

    /// Send everything currently queued
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    /// Stop the drain task, send what is left and close the transport
    pub async fn close(&self) {
        let _ = self.inner.shutdown_tx.send(());
        let task = self.inner.drain_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.inner.flush().await;

        let mut transport = self.inner.transport.lock().await;
        if let Some(transport) = transport.as_mut() {
            if let Err(e) = transport.close().await {
                debug!("Error closing transport: {}", e);
            }
        }
    }
}

fn session_id_for(config: &ClientConfig) -> String {
    config
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Handler turning `rpc_request` pushes into spawned dispatches
fn rpc_request_handler(weak: Weak<LoggerInner>) -> MessageHandler {
    Arc::new(move |message| match message {
        ServerMessage::RpcRequest {
            rpc_id,
            rpc_method,
            rpc_args,
        } => {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                let reply = dispatch_rpc(
                    &inner.rpc,
                    &inner.session_id,
                    &inner.application,
                    &rpc_id,
                    &rpc_method,
                    rpc_args,
                )
                .await;
                inner.enqueue(reply);
            });
        }
        ServerMessage::Error {
            error_code,
            error_message,
            error_entry_id,
        } => {
            warn!(
                "Server rejected entry {:?}: {:?} {}",
                error_entry_id, error_code, error_message
            );
        }
        other => debug!("Ignoring server message {:?}", other),
    })
}

async fn drain_loop(weak: Weak<LoggerInner>, mut shutdown_rx: broadcast::Receiver<()>) {
    let period = match weak.upgrade() {
        Some(inner) => Duration::from_millis(inner.config.drain_interval_ms.max(1)),
        None => return,
    };
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.tick().await;
            }
        }
    }
    debug!("Drain task stopped");
}

impl LoggerInner {
    fn base(&self, severity: Severity, kind: EntryType) -> LogEntry {
        let mut entry = LogEntry::new(&self.session_id, severity, kind, self.application.clone());
        entry.section = self.section.lock().clone();
        entry.group_id = self.groups.lock().last().cloned();
        entry
    }

    fn push(&self, message: QueuedMessage) {
        if !self.queue.lock().push(message) {
            debug!("Queue full, dropping entry");
        }
    }

    fn enqueue(&self, message: QueuedMessage) {
        self.start_session(None);
        self.push(message);
    }

    fn start_session(&self, metadata: Option<Tags>) {
        if self.session_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut metadata = metadata.unwrap_or_default();
        metadata
            .entry("hostname".to_string())
            .or_insert_with(|| self.hostname.clone());

        let mut start = session::session_start(
            &self.session_id,
            &self.config.app,
            &self.config.environment,
            Some(metadata),
        );
        if let QueuedMessage::Session(entry) = &mut start {
            entry.application.version = self.config.version.clone();
        }
        self.push(start);
    }

    /// One drain-task tick: reconnect if needed, then send queued batches
    async fn tick(&self) {
        if !self.backoff.lock().ready() {
            return;
        }

        let mut transport = self.transport.lock().await;
        if !transport.as_ref().is_some_and(|t| t.is_connected()) {
            match self.reconnect(&mut transport).await {
                Ok(()) => {
                    self.backoff.lock().reset();
                    self.tools_dirty.store(true, Ordering::SeqCst);
                }
                Err(e) => {
                    let delay = self.backoff.lock().fail();
                    debug!("Reconnect failed, retrying in {:?}: {}", delay, e);
                    return;
                }
            }
        }

        self.publish_tools(transport.as_mut()).await;
        loop {
            let outcome = drain_queue(transport.as_mut(), &self.queue, self.config.batch_size).await;
            self.backoff.lock().observe(outcome);
            if !matches!(outcome, DrainOutcome::Sent(n) if n == self.config.batch_size) {
                break;
            }
        }
    }

    async fn reconnect(&self, slot: &mut Option<Box<dyn TransportAdapter>>) -> Result<()> {
        match slot.as_mut() {
            Some(transport) => transport.connect().await,
            None => {
                let mut transport = create_transport(&self.options).await?;
                transport.on_message(self.message_handler.clone());
                *slot = Some(transport);
                Ok(())
            }
        }
    }

    async fn flush(&self) {
        let mut transport = self.transport.lock().await;
        self.publish_tools(transport.as_mut()).await;
        loop {
            let outcome = drain_queue(transport.as_mut(), &self.queue, self.config.batch_size).await;
            if !matches!(
                outcome,
                DrainOutcome::Sent(_) | DrainOutcome::Partial { requeued: 0, .. }
            ) {
                break;
            }
        }
    }

    /// Send the handler list if it changed since the last publish
    async fn publish_tools(&self, transport: Option<&mut Box<dyn TransportAdapter>>) {
        let Some(transport) = transport.filter(|t| t.is_connected()) else {
            return;
        };
        if !self.tools_dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = transport.publish_tools(&self.rpc.descriptors()).await {
            debug!("Publishing RPC handlers failed: {}", e);
            self.tools_dirty.store(true, Ordering::SeqCst);
        }
    }
}
