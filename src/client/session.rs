//! Session control entries, RPC dispatch and queue draining

use super::queue::LogQueue;
use super::rpc::RpcRegistry;
use super::transport::TransportAdapter;
use crate::types::{
    ApplicationInfo, EntryType, LogEntry, QueuedMessage, RpcDirection, SessionAction, Severity,
    Tags,
};
use futures_util::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default number of entries per send
pub const DEFAULT_MAX_BATCH: usize = 100;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Build the entry announcing a new session
pub fn session_start(
    session_id: &str,
    app: &str,
    environment: &str,
    metadata: Option<Tags>,
) -> QueuedMessage {
    let application = ApplicationInfo {
        name: app.to_string(),
        version: None,
        environment: Some(environment.to_string()),
    };
    let mut entry = LogEntry::new(session_id, Severity::Info, EntryType::Session, application);
    entry.session_action = Some(SessionAction::Start);
    if let Some(metadata) = metadata {
        entry = entry.with_tags(metadata);
    }
    QueuedMessage::Session(entry)
}

/// Build the entry closing a session
pub fn session_end(session_id: &str, application: ApplicationInfo) -> QueuedMessage {
    let mut entry = LogEntry::new(session_id, Severity::Info, EntryType::Session, application);
    entry.session_action = Some(SessionAction::End);
    QueuedMessage::Session(entry)
}

fn rpc_result(
    session_id: &str,
    application: &ApplicationInfo,
    rpc_id: &str,
    method: &str,
    outcome: Result<Value, String>,
) -> QueuedMessage {
    let severity = if outcome.is_ok() {
        Severity::Info
    } else {
        Severity::Error
    };
    let mut entry = LogEntry::new(session_id, severity, EntryType::Rpc, application.clone());
    entry.rpc_id = Some(rpc_id.to_string());
    entry.rpc_method = Some(method.to_string());
    match outcome {
        Ok(result) => {
            entry.rpc_direction = Some(RpcDirection::Response);
            entry.rpc_response = Some(result);
        }
        Err(message) => {
            entry.rpc_direction = Some(RpcDirection::Error);
            entry.rpc_error = Some(message);
        }
    }
    QueuedMessage::RpcResponse(entry)
}

/// Run the handler for `method` and build its single response.
///
/// Unknown methods, handler failures and handler panics become `rpc` error
/// entries; the result always carries `rpc_id`.
pub async fn dispatch_rpc(
    registry: &RpcRegistry,
    session_id: &str,
    application: &ApplicationInfo,
    rpc_id: &str,
    method: &str,
    args: Value,
) -> QueuedMessage {
    let Some(handler) = registry.get(method) else {
        warn!("RPC request for unknown method {}", method);
        return rpc_result(
            session_id,
            application,
            rpc_id,
            method,
            Err(format!("Unknown RPC method: {}", method)),
        );
    };

    let outcome = match AssertUnwindSafe(async move { handler.call(args).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result.map_err(|failure| failure.0),
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            warn!("RPC handler {} panicked: {}", method, reason);
            Err(format!("RPC handler panicked: {}", reason))
        }
    };
    rpc_result(session_id, application, rpc_id, method, outcome)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Result of one drain attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing to do: no transport, not connected, or empty queue
    Idle,
    /// This many entries were sent
    Sent(usize),
    /// The server stored part of the batch; refused-for-now entries went
    /// back on the queue and permanently refused ones were dropped
    Partial {
        /// Entries stored
        sent: usize,
        /// Entries queued again
        requeued: usize,
        /// Entries dropped as unacceptable
        rejected: usize,
    },
    /// Send failed and the batch went back on the queue
    Requeued {
        /// Entries that fit back in the queue
        requeued: usize,
        /// Entries the queue rejected
        dropped: usize,
    },
}

/// Send up to `max_batch` queued entries.
///
/// A failed send re-queues the whole batch. When the server answers per
/// entry, only entries it refused for now are re-queued.
pub async fn drain_queue(
    transport: Option<&mut Box<dyn TransportAdapter>>,
    queue: &parking_lot::Mutex<LogQueue>,
    max_batch: usize,
) -> DrainOutcome {
    let Some(transport) = transport else {
        return DrainOutcome::Idle;
    };
    if !transport.is_connected() {
        return DrainOutcome::Idle;
    }

    let batch = queue.lock().drain(Some(max_batch));
    if batch.is_empty() {
        return DrainOutcome::Idle;
    }

    match transport.send(&batch).await {
        Ok(report) if report.is_clean() => {
            debug!("Sent {} entries via {}", batch.len(), transport.kind());
            DrainOutcome::Sent(batch.len())
        }
        Ok(report) => {
            let total = batch.len();
            if !report.rejected.is_empty() {
                warn!(
                    "Server refused {} entries permanently: {:?}",
                    report.rejected.len(),
                    report.rejected
                );
            }
            let retry: HashSet<&str> = report.retry.iter().map(String::as_str).collect();
            let rejected: HashSet<&str> = report.rejected.iter().map(String::as_str).collect();
            let again: Vec<QueuedMessage> = batch
                .into_iter()
                .filter(|m| retry.contains(m.entry().id.as_str()))
                .collect();
            let refused = again.len() + rejected.len();
            let (requeued, _) = requeue(queue, again);
            DrainOutcome::Partial {
                sent: total.saturating_sub(refused),
                requeued,
                rejected: rejected.len(),
            }
        }
        Err(e) => {
            warn!("Send of {} entries failed: {}", batch.len(), e);
            let (requeued, dropped) = requeue(queue, batch);
            DrainOutcome::Requeued { requeued, dropped }
        }
    }
}

/// Push `messages` back; returns how many fit and how many were dropped
fn requeue(queue: &parking_lot::Mutex<LogQueue>, messages: Vec<QueuedMessage>) -> (usize, usize) {
    let total = messages.len();
    let mut queue = queue.lock();
    let mut requeued = 0;
    for message in messages {
        if queue.push(message) {
            requeued += 1;
        }
    }
    (requeued, total - requeued)
}

/// Exponential delay between failed drain attempts
#[derive(Debug, Clone)]
pub struct DrainBackoff {
    delay: Duration,
    retry_at: Option<Instant>,
}

impl DrainBackoff {
    /// Start with no pending delay
    pub fn new() -> Self {
        Self {
            delay: BACKOFF_INITIAL,
            retry_at: None,
        }
    }

    /// Whether an attempt is allowed at `now`
    pub fn ready_at(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |deadline| now >= deadline)
    }

    /// Whether an attempt is allowed now
    pub fn ready(&self) -> bool {
        self.ready_at(Instant::now())
    }

    /// Record a failure at `now`, doubling the delay up to the cap
    pub fn fail_at(&mut self, now: Instant) -> Duration {
        let delay = self.delay;
        self.retry_at = Some(now + delay);
        self.delay = (self.delay * 2).min(BACKOFF_MAX);
        delay
    }

    /// Record a failure now
    pub fn fail(&mut self) -> Duration {
        self.fail_at(Instant::now())
    }

    /// Clear the delay after a success
    pub fn reset(&mut self) {
        self.delay = BACKOFF_INITIAL;
        self.retry_at = None;
    }

    /// Record the outcome of a drain
    pub fn observe(&mut self, outcome: DrainOutcome) {
        match outcome {
            DrainOutcome::Sent(_) | DrainOutcome::Partial { requeued: 0, .. } => self.reset(),
            DrainOutcome::Partial { .. } | DrainOutcome::Requeued { .. } => {
                self.fail();
            }
            DrainOutcome::Idle => {}
        }
    }
}

impl Default for DrainBackoff {
    fn default() -> Self {
        Self::new()
    }
}
