//! Session lifecycle tracking

use crate::types::{ApplicationInfo, LogEntry, SessionAction, SessionInfo};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Session id used for the server's own entries
pub const SYSTEM_SESSION_ID: &str = "__system__";

/// Number of distinct viewer colour slots
pub const COLOR_POOL_SIZE: usize = 12;

/// A tracked session
pub type Session = SessionInfo;

/// Whether a session id belongs to the server itself
pub fn is_system_session(session_id: &str) -> bool {
    session_id.starts_with("__")
}

/// Registry of every session the server has seen
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<String, Session>,
    next_color: AtomicUsize,
}

impl SessionManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session, creating it with the next colour if unknown
    pub fn get_or_create(&self, session_id: &str, application: &ApplicationInfo) -> Session {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let now = Utc::now();
                Session {
                    session_id: session_id.to_string(),
                    application: application.clone(),
                    started_at: now,
                    last_heartbeat: now,
                    is_active: true,
                    log_count: 0,
                    color_index: self.next_color.fetch_add(1, Ordering::Relaxed) % COLOR_POOL_SIZE,
                }
            })
            .clone()
    }

    /// Count an accepted entry and refresh the heartbeat in one update
    pub fn record_entry(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.log_count += 1;
            session.last_heartbeat = Utc::now();
        }
    }

    /// Increment the entry counter
    pub fn increment_log_count(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.log_count += 1;
        }
    }

    /// Set the heartbeat timestamp
    pub fn touch_heartbeat(&self, session_id: &str, timestamp: DateTime<Utc>) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.last_heartbeat = timestamp;
        }
    }

    /// Apply a session control entry.
    ///
    /// Returns the action that changed state; `end` and `heartbeat` for an
    /// unknown session are ignored.
    pub fn handle_session_action(&self, entry: &LogEntry) -> Option<SessionAction> {
        let action = entry.session_action?;
        match action {
            SessionAction::Start => {
                self.get_or_create(&entry.session_id, &entry.application);
                let mut session = self.sessions.get_mut(&entry.session_id)?;
                session.application = entry.application.clone();
                session.is_active = true;
                session.last_heartbeat = entry.timestamp;
            }
            SessionAction::End => {
                let mut session = self.sessions.get_mut(&entry.session_id)?;
                session.is_active = false;
                session.last_heartbeat = entry.timestamp;
            }
            SessionAction::Heartbeat => {
                let mut session = self.sessions.get_mut(&entry.session_id)?;
                session.is_active = true;
                session.last_heartbeat = entry.timestamp;
            }
        }
        Some(action)
    }

    /// Mark sessions silent for longer than `timeout` as inactive.
    ///
    /// System sessions never expire. Returns the sessions that changed.
    pub fn expire_inactive(&self, timeout: Duration) -> Vec<Session> {
        self.expire_inactive_at(timeout, Utc::now())
    }

    /// [`expire_inactive`](Self::expire_inactive) at an explicit time
    pub fn expire_inactive_at(&self, timeout: Duration, now: DateTime<Utc>) -> Vec<Session> {
        let timeout = chrono::Duration::from_std(timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let mut expired = Vec::new();
        for mut session in self.sessions.iter_mut() {
            if session.is_active
                && !is_system_session(&session.session_id)
                && now - session.last_heartbeat > timeout
            {
                session.is_active = false;
                expired.push(session.clone());
            }
        }
        expired
    }

    /// Snapshot of one session
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Snapshot of all sessions, oldest first
    pub fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.iter().map(|s| s.clone()).collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    /// Number of known sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are known
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryType, Severity};
    use std::sync::Arc;

    fn control(session_id: &str, action: SessionAction) -> LogEntry {
        let mut entry = LogEntry::new(
            session_id,
            Severity::Info,
            EntryType::Session,
            ApplicationInfo::named("app"),
        );
        entry.session_action = Some(action);
        entry
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let manager = SessionManager::new();
        let first = manager.get_or_create("a", &ApplicationInfo::named("one"));
        let second = manager.get_or_create("a", &ApplicationInfo::named("two"));

        assert_eq!(first.color_index, second.color_index);
        assert_eq!(second.application.name, "one");
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_color_assignment_wraps() {
        let manager = SessionManager::new();
        let colors: Vec<usize> = (0..14)
            .map(|i| manager.get_or_create(&format!("s{}", i), &ApplicationInfo::default()).color_index)
            .collect();

        assert_eq!(&colors[..12], &(0..12).collect::<Vec<_>>()[..]);
        assert_eq!(colors[12], 0);
        assert_eq!(colors[13], 1);
    }

    #[test]
    fn test_record_entry_counts_and_touches() {
        let manager = SessionManager::new();
        let created = manager.get_or_create("a", &ApplicationInfo::default());
        manager.record_entry("a");
        manager.record_entry("a");
        manager.increment_log_count("a");

        let session = manager.get("a").unwrap();
        assert_eq!(session.log_count, 3);
        assert!(session.last_heartbeat >= created.last_heartbeat);

        // unknown sessions are ignored
        manager.record_entry("missing");
        assert!(manager.get("missing").is_none());
    }

    #[test]
    fn test_concurrent_log_count_is_exact() {
        let manager = Arc::new(SessionManager::new());
        manager.get_or_create("busy", &ApplicationInfo::default());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        manager.record_entry("busy");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(manager.get("busy").unwrap().log_count, 8000);
    }

    #[test]
    fn test_session_actions() {
        let manager = SessionManager::new();

        assert_eq!(manager.handle_session_action(&control("a", SessionAction::End)), None);
        assert_eq!(
            manager.handle_session_action(&control("a", SessionAction::Start)),
            Some(SessionAction::Start)
        );
        assert!(manager.get("a").unwrap().is_active);

        assert_eq!(
            manager.handle_session_action(&control("a", SessionAction::End)),
            Some(SessionAction::End)
        );
        assert!(!manager.get("a").unwrap().is_active);

        let heartbeat = control("a", SessionAction::Heartbeat);
        manager.handle_session_action(&heartbeat);
        let session = manager.get("a").unwrap();
        assert!(session.is_active);
        assert_eq!(session.last_heartbeat, heartbeat.timestamp);
    }

    #[test]
    fn test_expire_inactive() {
        let manager = SessionManager::new();
        manager.get_or_create("stale", &ApplicationInfo::default());
        manager.get_or_create("fresh", &ApplicationInfo::default());
        manager.get_or_create(SYSTEM_SESSION_ID, &ApplicationInfo::default());
        manager.touch_heartbeat("stale", Utc::now() - chrono::Duration::minutes(10));
        manager.touch_heartbeat(SYSTEM_SESSION_ID, Utc::now() - chrono::Duration::minutes(10));

        let expired = manager.expire_inactive(Duration::from_secs(300));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].session_id, "stale");
        assert!(!manager.get("stale").unwrap().is_active);
        assert!(manager.get("fresh").unwrap().is_active);
        assert!(manager.get(SYSTEM_SESSION_ID).unwrap().is_active);

        // already inactive sessions are not reported again
        assert!(manager.expire_inactive(Duration::from_secs(300)).is_empty());
    }

    #[test]
    fn test_system_session_prefix() {
        assert!(is_system_session(SYSTEM_SESSION_ID));
        assert!(is_system_session("__internal"));
        assert!(!is_system_session("_single"));
        assert!(!is_system_session("app-session"));
    }
}
