//! The single ingestion path shared by every listener

use super::hooks::HookManager;
use super::hub::BroadcastHub;
use super::rate_limiter::RateLimiter;
use super::ring_buffer::{HistoryQuery, RingBuffer};
use super::rpc_bridge::RpcBridge;
use super::session_manager::{is_system_session, SessionManager};
use crate::types::{
    EntryResult, EntryType, ErrorCode, HistorySource, LogEntry, RpcDirection, ServerMessage,
    MAX_BATCH_SIZE,
};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Entries buffered for the external store before new ones are dropped
const STORE_QUEUE_CAPACITY: usize = 8192;

/// Entries handed to the external store per call
const STORE_BATCH_SIZE: usize = 500;

/// Split one inbound payload into its raw entry items.
///
/// Accepts a single entry, a JSON array of entries or a
/// `{"entries": [...]}` batch object.
pub fn split_payload(payload: &str) -> std::result::Result<Vec<Value>, serde_json::Error> {
    match serde_json::from_str::<Value>(payload)? {
        Value::Array(items) => Ok(items),
        Value::Object(mut object) if object.contains_key("entries") && !object.contains_key("id") => {
            serde_json::from_value(object.remove("entries").unwrap_or_default())
        }
        single => Ok(vec![single]),
    }
}

/// Decode the entries of one inbound payload, see [`split_payload`]
pub fn decode_entries(payload: &str) -> std::result::Result<Vec<LogEntry>, serde_json::Error> {
    split_payload(payload)?
        .into_iter()
        .map(serde_json::from_value)
        .collect()
}

fn batch_too_large(len: usize) -> ServerMessage {
    ServerMessage::error(
        ErrorCode::PayloadTooLarge,
        format!("Batch of {} exceeds {} entries", len, MAX_BATCH_SIZE),
        None,
    )
}

/// Durable external store entries are forwarded to
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Persist a batch of entries
    async fn forward(&self, entries: &[LogEntry]) -> Result<()>;

    /// Read entries matching a query
    async fn query(&self, query: &HistoryQuery) -> Result<Vec<LogEntry>>;
}

/// What happened to an entry handed to [`IngestService::ingest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored and broadcast
    Accepted,
    /// Dropped by the rate limiter
    RateLimited,
}

/// Rate limiting, session tracking, storage and fan-out for incoming entries
pub struct IngestService {
    limiter: Arc<RateLimiter>,
    sessions: Arc<SessionManager>,
    buffer: Arc<RingBuffer>,
    hub: Arc<BroadcastHub>,
    rpc: Arc<RpcBridge>,
    hooks: Arc<HookManager>,
    state: DashMap<String, Map<String, Value>>,
    store: Option<Arc<dyn EntryStore>>,
    store_tx: Option<mpsc::Sender<LogEntry>>,
}

impl IngestService {
    /// Wire the service to its collaborators
    pub fn new(
        limiter: Arc<RateLimiter>,
        sessions: Arc<SessionManager>,
        buffer: Arc<RingBuffer>,
        hub: Arc<BroadcastHub>,
        rpc: Arc<RpcBridge>,
    ) -> Self {
        Self {
            limiter,
            sessions,
            buffer,
            hub,
            rpc,
            hooks: Arc::new(HookManager::new()),
            state: DashMap::new(),
            store: None,
            store_tx: None,
        }
    }

    /// Run entries through `hooks`
    pub fn with_hooks(mut self, hooks: Arc<HookManager>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Forward accepted entries to `store` and allow history reads from it.
    ///
    /// Spawns the forwarding task, so it must be called within a Tokio
    /// runtime.
    pub fn with_store(mut self, store: Arc<dyn EntryStore>) -> Self {
        let (tx, rx) = mpsc::channel(STORE_QUEUE_CAPACITY);
        tokio::spawn(forward_to_store(store.clone(), rx));
        self.store = Some(store);
        self.store_tx = Some(tx);
        self
    }

    /// Session registry
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Entry buffer
    pub fn buffer(&self) -> &Arc<RingBuffer> {
        &self.buffer
    }

    /// Viewer hub
    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Rate limiter
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// RPC bridge
    pub fn rpc(&self) -> &Arc<RpcBridge> {
        &self.rpc
    }

    /// Ingestion hooks
    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.hooks
    }

    /// Decode a payload of one or more entries, running pre-validate hooks
    /// on every item
    pub fn decode(&self, payload: &str) -> std::result::Result<Vec<LogEntry>, serde_json::Error> {
        split_payload(payload)?
            .into_iter()
            .map(|item| serde_json::from_value(self.hooks.run_pre_validate(item)))
            .collect()
    }

    /// Decode a payload holding exactly one entry
    pub fn decode_one(&self, payload: &str) -> std::result::Result<LogEntry, serde_json::Error> {
        let raw = serde_json::from_str(payload)?;
        serde_json::from_value(self.hooks.run_pre_validate(raw))
    }

    /// Run one entry through the pipeline
    pub fn ingest(&self, entry: LogEntry) -> IngestOutcome {
        let entry = self.hooks.run_post_validate(entry);
        if !self.limiter.try_consume(&entry.session_id) {
            debug!("Rate limited entry {} from {}", entry.id, entry.session_id);
            return IngestOutcome::RateLimited;
        }

        if entry.kind == EntryType::Session {
            if let Some(action) = self.sessions.handle_session_action(&entry) {
                self.hub.broadcast(&ServerMessage::SessionUpdate {
                    session_id: entry.session_id.clone(),
                    session_action: action,
                    application: Some(entry.application.clone()),
                });
            }
        }
        self.sessions
            .get_or_create(&entry.session_id, &entry.application);
        self.sessions.record_entry(&entry.session_id);

        if entry.kind == EntryType::State {
            self.apply_state(&entry);
        }

        self.buffer.upsert(entry.clone());
        self.forward(&entry);
        self.hooks.run_post_store(&entry);

        if entry.is_rpc_result() {
            self.complete_rpc(&entry);
        }
        self.hub.broadcast(&ServerMessage::Log { entry });
        IngestOutcome::Accepted
    }

    /// Validate and ingest one entry
    pub fn admit(&self, entry: LogEntry) -> EntryResult {
        if let Err(e) = entry.validate() {
            return EntryResult::rejected(entry.id, ErrorCode::ValidationFailed, e.to_string());
        }
        let id = entry.id.clone();
        match self.ingest(entry) {
            IngestOutcome::Accepted => EntryResult::accepted(id),
            IngestOutcome::RateLimited => {
                EntryResult::rejected(id, ErrorCode::RateLimited, "Rate limit exceeded")
            }
        }
    }

    /// Decode, validate and ingest raw items one by one.
    ///
    /// Every item gets its own result, so a refused item never affects the
    /// others. Only an oversized batch is refused as a whole.
    pub fn ingest_items(&self, items: Vec<Value>) -> std::result::Result<Vec<EntryResult>, ServerMessage> {
        if items.len() > MAX_BATCH_SIZE {
            return Err(batch_too_large(items.len()));
        }

        Ok(items
            .into_iter()
            .map(|item| {
                let raw = self.hooks.run_pre_validate(item);
                let id = raw
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                match serde_json::from_value::<LogEntry>(raw) {
                    Ok(entry) => self.admit(entry),
                    Err(e) => EntryResult::rejected(id, ErrorCode::ValidationFailed, e.to_string()),
                }
            })
            .collect())
    }

    /// Validate and ingest a batch, answering with an `ack` of accepted ids
    /// or an `error` naming the first rejected entry.
    ///
    /// Entries after a rejected one are still ingested.
    pub fn ingest_batch(&self, entries: Vec<LogEntry>) -> ServerMessage {
        if entries.len() > MAX_BATCH_SIZE {
            return batch_too_large(entries.len());
        }

        let mut ack_ids = Vec::with_capacity(entries.len());
        let mut first_rejection: Option<EntryResult> = None;
        for entry in entries {
            let result = self.admit(entry);
            if result.ok {
                ack_ids.push(result.id);
            } else {
                first_rejection.get_or_insert(result);
            }
        }

        match first_rejection {
            None => ServerMessage::Ack { ack_ids },
            Some(rejected) => ServerMessage::error(
                rejected.error_code.unwrap_or(ErrorCode::ValidationFailed),
                rejected.error_message.unwrap_or_default(),
                Some(rejected.id),
            ),
        }
    }

    /// Serve one page of history, from the store when asked and available
    pub async fn history(
        &self,
        query_id: impl Into<String>,
        query: &HistoryQuery,
        source: Option<HistorySource>,
    ) -> ServerMessage {
        let query_id = query_id.into();
        let fence_ts = Utc::now();

        if source == Some(HistorySource::Store) {
            if let Some(store) = &self.store {
                match store.query(query).await {
                    Ok(entries) => {
                        let has_more = entries.len() >= query.page_size();
                        return ServerMessage::History {
                            query_id,
                            history_entries: entries,
                            has_more,
                            cursor: None,
                            source: HistorySource::Store,
                            fence_ts,
                        };
                    }
                    Err(e) => warn!("Store history query failed, using buffer: {}", e),
                }
            }
        }

        let page = self.buffer.query(query);
        ServerMessage::History {
            query_id,
            cursor: page
                .has_more
                .then(|| page.next_cursor.map(|c| c.to_string()))
                .flatten(),
            has_more: page.has_more,
            history_entries: page.entries,
            source: HistorySource::Buffer,
            fence_ts,
        }
    }

    /// Current state map of a session
    pub fn state_snapshot(&self, session_id: &str) -> ServerMessage {
        let state = self
            .state
            .get(session_id)
            .map(|s| s.clone())
            .unwrap_or_default();
        ServerMessage::StateSnapshot {
            session_id: session_id.to_string(),
            state,
        }
    }

    /// `session_list` message with every known session
    pub fn session_list(&self) -> ServerMessage {
        ServerMessage::SessionList {
            sessions: self.sessions.sessions(),
        }
    }

    fn apply_state(&self, entry: &LogEntry) {
        let Some(key) = &entry.state_key else {
            return;
        };
        let mut state = self.state.entry(entry.session_id.clone()).or_default();
        match &entry.state_value {
            None | Some(Value::Null) => {
                state.remove(key);
            }
            Some(value) => {
                state.insert(key.clone(), value.clone());
            }
        }
    }

    fn forward(&self, entry: &LogEntry) {
        let Some(tx) = &self.store_tx else {
            return;
        };
        if is_system_session(&entry.session_id) {
            return;
        }
        match tx.try_send(entry.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Store queue full, entry {} not forwarded", entry.id),
            Err(TrySendError::Closed(_)) => debug!("Store forwarder stopped"),
        }
    }

    fn complete_rpc(&self, entry: &LogEntry) {
        let Some(rpc_id) = &entry.rpc_id else {
            return;
        };
        let result = match entry.rpc_direction {
            Some(RpcDirection::Error) => Err(entry
                .rpc_error
                .clone()
                .unwrap_or_else(|| "RPC failed".to_string())),
            _ => Ok(entry.rpc_response.clone().unwrap_or(Value::Null)),
        };
        if !self.rpc.complete(rpc_id, result) {
            debug!("No pending call for RPC result {}", rpc_id);
        }
    }
}

async fn forward_to_store(store: Arc<dyn EntryStore>, mut rx: mpsc::Receiver<LogEntry>) {
    let mut batch = Vec::with_capacity(STORE_BATCH_SIZE);
    while let Some(entry) = rx.recv().await {
        batch.push(entry);
        while batch.len() < STORE_BATCH_SIZE {
            match rx.try_recv() {
                Ok(entry) => batch.push(entry),
                Err(_) => break,
            }
        }
        if let Err(e) = store.forward(&batch).await {
            warn!("Failed to forward {} entries to store: {}", batch.len(), e);
        }
        batch.clear();
    }
}
