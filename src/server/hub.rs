//! Live fan-out to connected viewers
//!
//! Each viewer owns a bounded channel of pre-serialised frames. The set of
//! viewers is an `ArcSwap` snapshot: broadcasts read it lock-free while
//! subscribe and unsubscribe publish a new set.

use crate::types::{LogEntry, ServerMessage, Severity};
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

/// Frames buffered per viewer before new ones are dropped
pub const VIEWER_CHANNEL_CAPACITY: usize = 1024;

/// Serialised frame shared by every viewer it is sent to
pub type Frame = Arc<str>;

/// What a viewer wants to see of the live stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewerSubscription {
    /// Sessions to follow; empty follows all
    pub session_ids: Vec<String>,
    /// Minimum severity delivered
    pub min_severity: Option<Severity>,
    /// Case-insensitive substring of the text or a tag value
    pub text_filter: Option<String>,
}

impl ViewerSubscription {
    /// Whether a live entry passes this subscription
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if !self.session_ids.is_empty() && !self.session_ids.contains(&entry.session_id) {
            return false;
        }
        if matches!(self.min_severity, Some(min) if entry.severity < min) {
            return false;
        }
        if let Some(filter) = &self.text_filter {
            let filter = filter.to_lowercase();
            let in_text = entry
                .text
                .as_ref()
                .is_some_and(|text| text.to_lowercase().contains(&filter));
            let in_tags = entry.tags.as_ref().is_some_and(|tags| {
                tags.values().any(|value| value.to_lowercase().contains(&filter))
            });
            if !in_text && !in_tags {
                return false;
            }
        }
        true
    }
}

#[derive(Debug)]
struct Viewer {
    id: u64,
    sender: mpsc::Sender<Frame>,
    subscription: RwLock<ViewerSubscription>,
}

/// A registered viewer's id and frame receiver
#[derive(Debug)]
pub struct ViewerHandle {
    /// Viewer identifier
    pub id: u64,
    /// Frames addressed to this viewer
    pub receiver: mpsc::Receiver<Frame>,
}

/// Outcome of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Viewers that received the frame
    pub delivered: usize,
    /// Viewers whose channel was full
    pub dropped: usize,
    /// Viewers found closed and removed
    pub disconnected: usize,
}

/// Registry of live viewers
#[derive(Debug)]
pub struct BroadcastHub {
    viewers: ArcSwap<Vec<Arc<Viewer>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    /// Create a hub with the default per-viewer capacity
    pub fn new() -> Self {
        Self::with_capacity(VIEWER_CHANNEL_CAPACITY)
    }

    /// Create a hub with a custom per-viewer capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            viewers: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Register a viewer following every session
    pub fn subscribe(&self) -> ViewerHandle {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let viewer = Arc::new(Viewer {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            sender,
            subscription: RwLock::new(ViewerSubscription::default()),
        });
        let id = viewer.id;

        self.viewers.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(viewer.clone());
            next
        });
        debug!("Viewer {} subscribed", id);

        ViewerHandle { id, receiver }
    }

    /// Remove a viewer; returns whether it was registered
    pub fn unsubscribe(&self, id: u64) -> bool {
        let before = self.viewers.load().len();
        self.remove(&[id]);
        self.viewers.load().len() < before
    }

    /// Replace a viewer's subscription
    pub fn set_subscription(&self, id: u64, subscription: ViewerSubscription) -> bool {
        match self.viewers.load().iter().find(|v| v.id == id) {
            Some(viewer) => {
                *viewer.subscription.write() = subscription;
                true
            }
            None => false,
        }
    }

    /// Current subscription of a viewer
    pub fn subscription(&self, id: u64) -> Option<ViewerSubscription> {
        self.viewers
            .load()
            .iter()
            .find(|v| v.id == id)
            .map(|v| v.subscription.read().clone())
    }

    /// Number of connected viewers
    pub fn viewer_count(&self) -> usize {
        self.viewers.load().len()
    }

    /// Send a message to a single viewer, bypassing subscription filters
    pub fn send_to(&self, id: u64, message: &ServerMessage) -> bool {
        let Some(frame) = serialize(message) else {
            return false;
        };
        let viewers = self.viewers.load();
        let Some(viewer) = viewers.iter().find(|v| v.id == id) else {
            return false;
        };
        match viewer.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Closed(_)) => {
                self.remove(&[id]);
                false
            }
        }
    }

    /// Send a message to every viewer whose subscription matches.
    ///
    /// Filters apply to `log` and `logs` only; everything else goes to all
    /// viewers. A full channel drops the frame for that viewer alone.
    pub fn broadcast(&self, message: &ServerMessage) -> BroadcastReport {
        let viewers = self.viewers.load();
        let mut report = BroadcastReport::default();
        if viewers.is_empty() {
            return report;
        }

        let Some(shared) = serialize(message) else {
            return report;
        };
        let mut closed = Vec::new();

        for viewer in viewers.iter() {
            let frame = match message {
                ServerMessage::Log { entry } => {
                    if !viewer.subscription.read().matches(entry) {
                        continue;
                    }
                    shared.clone()
                }
                ServerMessage::Logs { entries } => {
                    let subscription = viewer.subscription.read();
                    let visible: Vec<&LogEntry> =
                        entries.iter().filter(|e| subscription.matches(e)).collect();
                    if visible.is_empty() {
                        continue;
                    }
                    if visible.len() == entries.len() {
                        shared.clone()
                    } else {
                        let subset = ServerMessage::Logs {
                            entries: visible.into_iter().cloned().collect(),
                        };
                        match serialize(&subset) {
                            Some(frame) => frame,
                            None => continue,
                        }
                    }
                }
                _ => shared.clone(),
            };

            match viewer.sender.try_send(frame) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    trace!("Viewer {} is lagging, frame dropped", viewer.id);
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => closed.push(viewer.id),
            }
        }

        if !closed.is_empty() {
            report.disconnected = closed.len();
            self.remove(&closed);
        }
        report
    }

    fn remove(&self, ids: &[u64]) {
        self.viewers.rcu(|current| {
            current
                .iter()
                .filter(|v| !ids.contains(&v.id))
                .cloned()
                .collect::<Vec<_>>()
        });
        for id in ids {
            debug!("Viewer {} removed", id);
        }
    }
}

fn serialize(message: &ServerMessage) -> Option<Frame> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            debug!("Failed to serialise server message: {}", e);
            None
        }
    }
}
