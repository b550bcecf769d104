//! Wire envelopes exchanged between clients, server and viewers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::log_entry::{ApplicationInfo, LogEntry, SessionAction, Severity};

/// Client-local representation of an outgoing message
///
/// Each variant wraps the exact entry it becomes on the wire; the variant
/// only records why it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entry", rename_all = "snake_case")]
pub enum QueuedMessage {
    /// Regular log event
    Event(LogEntry),
    /// Session start/end control message
    Session(LogEntry),
    /// Response to a server-initiated RPC request
    RpcResponse(LogEntry),
}

impl QueuedMessage {
    /// The wrapped entry
    pub fn entry(&self) -> &LogEntry {
        match self {
            QueuedMessage::Event(entry)
            | QueuedMessage::Session(entry)
            | QueuedMessage::RpcResponse(entry) => entry,
        }
    }

    /// Consume the message, returning the wrapped entry
    pub fn into_entry(self) -> LogEntry {
        match self {
            QueuedMessage::Event(entry)
            | QueuedMessage::Session(entry)
            | QueuedMessage::RpcResponse(entry) => entry,
        }
    }
}

/// Machine-readable error codes carried by `error` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Entry or batch failed validation
    ValidationFailed,
    /// Rate limit exceeded
    RateLimited,
    /// Session id not known to the server
    SessionNotFound,
    /// Unexpected server failure
    InternalError,
    /// Body or batch too large
    PayloadTooLarge,
    /// RPC target did not answer in time
    RpcTimeout,
    /// RPC target session is not connected
    RpcTargetNotFound,
    /// Connection limit reached
    MaxConnections,
}

impl ErrorCode {
    /// Whether the same entry may succeed when sent again later
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited | ErrorCode::InternalError | ErrorCode::MaxConnections
        )
    }
}

/// Outcome of one entry of an HTTP batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryResult {
    /// Entry id, empty when the item could not be decoded
    #[serde(default)]
    pub id: String,
    /// Whether the entry was stored
    pub ok: bool,
    /// Why the entry was refused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Human-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl EntryResult {
    /// Entry stored
    pub fn accepted(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: true,
            error_code: None,
            error_message: None,
        }
    }

    /// Entry refused
    pub fn rejected(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            error_code: Some(code),
            error_message: Some(message.into()),
        }
    }
}

/// Body answering `POST /api/v1/logs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    /// The batch itself was well formed
    pub ok: bool,
    /// One result per submitted entry, in order
    pub results: Vec<EntryResult>,
}

/// Whether an RPC handler only reads state or performs an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcCategory {
    /// Side-effect free query
    #[default]
    Getter,
    /// Action with side effects
    Tool,
}

/// Metadata a client publishes for each RPC handler it exposes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcDescriptor {
    /// Method name
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Getter or tool
    #[serde(default)]
    pub category: RpcCategory,
    /// JSON schema of the arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_schema: Option<Value>,
    /// Viewer should confirm before calling
    #[serde(default)]
    pub confirm: bool,
}

/// Control frames a client sends alongside its entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientControl {
    /// Replace the RPC handlers published for a session
    RegisterTools {
        /// Owning session; the connection's session when omitted
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Every handler the client currently exposes
        tools: Vec<RpcDescriptor>,
    },
}

impl ClientControl {
    /// Decode a frame if it is a control frame rather than entries
    pub fn from_frame(text: &str) -> Option<Self> {
        if !text.contains("register_tools") {
            return None;
        }
        let value: Value = serde_json::from_str(text).ok()?;
        match value.get("type").and_then(Value::as_str) {
            Some("register_tools") => serde_json::from_value(value).ok(),
            _ => None,
        }
    }
}

/// Which backend served a history query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    /// The in-memory ring buffer
    Buffer,
    /// An external durable store
    Store,
}

/// Session state as reported to viewers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identifier
    pub session_id: String,
    /// Emitting application
    pub application: ApplicationInfo,
    /// When the server first saw this session
    pub started_at: DateTime<Utc>,
    /// Last time an entry or heartbeat arrived
    pub last_heartbeat: DateTime<Utc>,
    /// Whether the session is considered live
    pub is_active: bool,
    /// Number of accepted entries
    pub log_count: u64,
    /// Stable viewer-side colour slot
    pub color_index: usize,
}

/// Server to client/viewer envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Entries accepted
    Ack {
        /// Accepted entry ids
        ack_ids: Vec<String>,
    },
    /// Request or entry rejected
    Error {
        /// Error code
        error_code: ErrorCode,
        /// Human-readable description
        error_message: String,
        /// Entry that caused the error
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_entry_id: Option<String>,
    },
    /// Single live entry
    Log {
        /// The entry
        entry: LogEntry,
    },
    /// Multiple live entries
    Logs {
        /// The entries
        entries: Vec<LogEntry>,
    },
    /// RPC call routed to a client
    RpcRequest {
        /// Correlation id
        rpc_id: String,
        /// Method name
        rpc_method: String,
        /// Arguments
        #[serde(default)]
        rpc_args: Value,
    },
    /// RPC result routed to a viewer
    RpcResponse {
        /// Correlation id
        rpc_id: String,
        /// Result on success
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rpc_response: Option<Value>,
        /// Failure message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rpc_error: Option<String>,
    },
    /// All known sessions
    SessionList {
        /// Sessions
        sessions: Vec<SessionInfo>,
    },
    /// A session changed state
    SessionUpdate {
        /// Session identifier
        session_id: String,
        /// What happened
        session_action: SessionAction,
        /// Application metadata
        #[serde(default, skip_serializing_if = "Option::is_none")]
        application: Option<ApplicationInfo>,
    },
    /// Current state map of a session
    StateSnapshot {
        /// Session identifier
        session_id: String,
        /// Key/value state
        state: Map<String, Value>,
    },
    /// RPC handlers published by clients, keyed by session
    RpcTools {
        /// Descriptors per session
        tools: BTreeMap<String, Vec<RpcDescriptor>>,
    },
    /// Page of historical entries
    History {
        /// Echo of the viewer's query id
        query_id: String,
        /// Entries, oldest first
        history_entries: Vec<LogEntry>,
        /// Whether another page exists
        has_more: bool,
        /// Cursor for the next page
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<String>,
        /// Backend that served the page
        source: HistorySource,
        /// Server time the query ran at, for dedup against live entries
        fence_ts: DateTime<Utc>,
    },
}

impl ServerMessage {
    /// Build an error message
    pub fn error(code: ErrorCode, message: impl Into<String>, entry_id: Option<String>) -> Self {
        ServerMessage::Error {
            error_code: code,
            error_message: message.into(),
            error_entry_id: entry_id,
        }
    }
}

/// Viewer to server commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerCommand {
    /// Replace the viewer's live subscription
    Subscribe {
        /// Sessions to follow; empty follows all
        #[serde(default)]
        session_ids: Vec<String>,
        /// Minimum severity to deliver
        #[serde(default)]
        min_severity: Option<Severity>,
        /// Case-insensitive substring filter
        #[serde(default)]
        text_filter: Option<String>,
    },
    /// Reset the subscription to all sessions
    Unsubscribe,
    /// Page through history
    HistoryQuery {
        /// Correlation id echoed in the response
        query_id: String,
        /// Restrict to one session
        #[serde(default)]
        session_id: Option<String>,
        /// Restrict to one severity
        #[serde(default)]
        severity: Option<Severity>,
        /// Page size
        #[serde(default)]
        limit: Option<usize>,
        /// Cursor from a previous page
        #[serde(default)]
        cursor: Option<String>,
        /// Preferred backend
        #[serde(default)]
        source: Option<HistorySource>,
    },
    /// Call an RPC handler registered by a client
    RpcRequest {
        /// Correlation id
        rpc_id: String,
        /// Session owning the handler
        target_session_id: String,
        /// Method name
        rpc_method: String,
        /// Arguments
        #[serde(default)]
        rpc_args: Value,
    },
    /// Ask for a session's state map
    StateQuery {
        /// Session identifier
        session_id: String,
    },
    /// Ask for published RPC handlers
    ToolsQuery {
        /// Restrict to one session
        #[serde(default)]
        session_id: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::log_entry::ApplicationInfo;

    #[test]
    fn test_server_message_tagging() {
        let msg = ServerMessage::error(ErrorCode::RateLimited, "slow down", Some("e-1".into()));
        let json: Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "error");
        assert_eq!(json["error_code"], "RATE_LIMITED");
        assert_eq!(json["error_entry_id"], "e-1");
    }

    #[test]
    fn test_history_message_fields() {
        let msg = ServerMessage::History {
            query_id: "q".into(),
            history_entries: vec![],
            has_more: false,
            cursor: None,
            source: HistorySource::Buffer,
            fence_ts: Utc::now(),
        };
        let json: Value = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "history");
        assert_eq!(json["source"], "buffer");
        assert!(json["fence_ts"].is_string());
        assert!(json.get("cursor").is_none());
    }

    #[test]
    fn test_viewer_command_parsing() {
        let raw = r#"{"type":"subscribe","session_ids":["a"],"min_severity":"warning"}"#;
        let cmd: ViewerCommand = serde_json::from_str(raw).unwrap();
        assert_eq!(
            cmd,
            ViewerCommand::Subscribe {
                session_ids: vec!["a".into()],
                min_severity: Some(Severity::Warning),
                text_filter: None,
            }
        );

        let raw = r#"{"type":"unsubscribe"}"#;
        assert_eq!(serde_json::from_str::<ViewerCommand>(raw).unwrap(), ViewerCommand::Unsubscribe);
    }

    #[test]
    fn test_register_tools_frame() {
        let frame = r#"{"type":"register_tools","tools":[{"name":"restart","category":"tool","confirm":true}]}"#;
        match ClientControl::from_frame(frame) {
            Some(ClientControl::RegisterTools { session_id, tools }) => {
                assert!(session_id.is_none());
                assert_eq!(tools[0].name, "restart");
                assert_eq!(tools[0].category, RpcCategory::Tool);
                assert!(tools[0].confirm);
            }
            other => panic!("expected register_tools, got {:?}", other),
        }

        // entries are not control frames
        let entry = LogEntry::text("s", Severity::Info, ApplicationInfo::default(), "x");
        assert!(ClientControl::from_frame(&serde_json::to_string(&entry).unwrap()).is_none());
        assert!(ClientControl::from_frame("[]").is_none());
    }

    #[test]
    fn test_entry_results() {
        let json = serde_json::to_value(EntryResult::accepted("e-1")).unwrap();
        assert_eq!(json, serde_json::json!({"id": "e-1", "ok": true}));

        let rejected = EntryResult::rejected("e-2", ErrorCode::RateLimited, "slow down");
        assert!(rejected.error_code.unwrap().is_retryable());
        assert!(!ErrorCode::ValidationFailed.is_retryable());
    }

    #[test]
    fn test_queued_message_unwraps_entry() {
        let entry = LogEntry::text("s", Severity::Info, ApplicationInfo::default(), "x");
        let msg = QueuedMessage::Session(entry.clone());
        assert_eq!(msg.entry(), &entry);
        assert_eq!(msg.into_entry(), entry);
    }
}
