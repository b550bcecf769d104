//! Server operational events as regular log entries
//!
//! Entries land in the `__system__` session so viewers see them next to
//! client traffic. They are never forwarded to an external store.

use super::hub::BroadcastHub;
use super::ring_buffer::RingBuffer;
use super::session_manager::{SessionManager, SYSTEM_SESSION_ID};
use crate::types::{ApplicationInfo, EntryType, LogEntry, ServerMessage, Severity, Tags};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Application name of system entries
pub const SYSTEM_APP_NAME: &str = "logbeam-server";

/// Logs server events into the pipeline and through `tracing`
#[derive(Debug)]
pub struct SelfLogger {
    buffer: Arc<RingBuffer>,
    hub: Arc<BroadcastHub>,
    sessions: Arc<SessionManager>,
    application: ApplicationInfo,
    counter: AtomicU64,
}

impl SelfLogger {
    /// Create the logger and register the system session
    pub fn new(buffer: Arc<RingBuffer>, hub: Arc<BroadcastHub>, sessions: Arc<SessionManager>) -> Self {
        let application = ApplicationInfo {
            name: SYSTEM_APP_NAME.to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            environment: Some("system".to_string()),
        };
        sessions.get_or_create(SYSTEM_SESSION_ID, &application);

        Self {
            buffer,
            hub,
            sessions,
            application,
            counter: AtomicU64::new(0),
        }
    }

    /// Record a system event
    pub fn log(&self, severity: Severity, text: impl Into<String>) {
        let text = text.into();
        match severity {
            Severity::Debug => tracing::debug!(target: "logbeam::system", "{}", text),
            Severity::Info => tracing::info!(target: "logbeam::system", "{}", text),
            Severity::Warning => tracing::warn!(target: "logbeam::system", "{}", text),
            Severity::Error | Severity::Critical => {
                tracing::error!(target: "logbeam::system", "{}", text)
            }
        }

        let mut entry = LogEntry::new(
            SYSTEM_SESSION_ID,
            severity,
            EntryType::Text,
            self.application.clone(),
        );
        entry.id = format!(
            "sys-{}-{}",
            Utc::now().timestamp_millis(),
            self.counter.fetch_add(1, Ordering::Relaxed)
        );
        entry.section = Some("system".to_string());
        entry.text = Some(text);
        let mut tags = Tags::new();
        tags.insert("source".to_string(), "self-logger".to_string());
        entry = entry.with_tags(tags);

        self.buffer.push(entry.clone());
        self.hub.broadcast(&ServerMessage::Log { entry });
        self.sessions.increment_log_count(SYSTEM_SESSION_ID);
    }

    /// Record a debug event
    pub fn debug(&self, text: impl Into<String>) {
        self.log(Severity::Debug, text);
    }

    /// Record an info event
    pub fn info(&self, text: impl Into<String>) {
        self.log(Severity::Info, text);
    }

    /// Record a warning
    pub fn warn(&self, text: impl Into<String>) {
        self.log(Severity::Warning, text);
    }

    /// Record an error
    pub fn error(&self, text: impl Into<String>) {
        self.log(Severity::Error, text);
    }
}
