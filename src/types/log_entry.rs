//! Log entry types and utilities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::{LogBeamError, Result};

/// Type alias for entry tags
pub type Tags = BTreeMap<String, String>;

/// Maximum session id length accepted by the server
pub const MAX_SESSION_ID_LENGTH: usize = 256;

/// Maximum number of tags per entry
pub const MAX_TAGS: usize = 32;

/// Maximum number of entries in a single batch
pub const MAX_BATCH_SIZE: usize = 1000;

/// Log severity levels, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Debug-level messages
    Debug,
    /// Informational messages
    Info,
    /// Warning conditions
    Warning,
    /// Error conditions
    Error,
    /// Critical conditions
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Debug => write!(f, "DEBUG"),
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Critical => write!(f, "CRIT"),
        }
    }
}

/// Discriminator for the payload carried by an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Plain text, optionally with a JSON attachment
    Text,
    /// Error with message, stack frames and cause chain
    Exception,
    /// Inline or referenced image
    Image,
    /// Key/value state upsert
    State,
    /// Session lifecycle control
    Session,
    /// Remote procedure call envelope
    Rpc,
    /// Group open/close marker
    Group,
}

/// Session lifecycle actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionAction {
    /// Session started
    Start,
    /// Session ended
    End,
    /// Liveness ping
    Heartbeat,
}

/// Group actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupAction {
    /// Open a group
    Open,
    /// Close a group
    Close,
}

/// Direction of an RPC envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcDirection {
    /// Call from a viewer to a client
    Request,
    /// Successful result
    Response,
    /// Failed result
    Error,
}

/// Metadata about the emitting application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    /// Application name, e.g. "my-api-server"
    pub name: String,
    /// Application version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Deployment environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl ApplicationInfo {
    /// Application info with only a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            environment: None,
        }
    }
}

impl Default for ApplicationInfo {
    fn default() -> Self {
        Self::named("unknown")
    }
}

/// A single resolved stack frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    /// File path or URI
    pub uri: String,
    /// 1-based line number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// 1-based column number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    /// Function or method name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Whether the frame belongs to third-party code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_vendor: Option<bool>,
    /// Original unparsed frame text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

/// Exception payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionData {
    /// Error type name
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Error message
    pub message: String,
    /// Parsed stack frames, innermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack_trace: Vec<StackFrame>,
    /// Chained cause
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ExceptionData>>,
}

impl ExceptionData {
    /// Build exception data from an error and its `source()` chain
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            kind: None,
            message: err.to_string(),
            stack_trace: Vec::new(),
            cause: err.source().map(|source| Box::new(Self::from_error(source))),
        }
    }
}

/// Image payload, either inline base64 data or an upload reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    /// Base64-encoded image bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Reference to previously uploaded content
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// MIME type, e.g. "image/png"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Width in pixels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    /// Height in pixels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A structured log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Caller-generated identifier, unique within a session
    pub id: String,

    /// Session this entry belongs to
    pub session_id: String,

    /// Timestamp when the entry was created on the client
    pub timestamp: DateTime<Utc>,

    /// Severity level
    pub severity: Severity,

    /// Payload discriminator
    #[serde(rename = "type")]
    pub kind: EntryType,

    /// Emitting application
    #[serde(default)]
    pub application: ApplicationInfo,

    /// Viewer section this entry belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,

    /// Free-form string tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Tags>,

    /// Replace an earlier entry with the same id instead of appending
    #[serde(default, skip_serializing_if = "is_false")]
    pub replace: bool,

    /// Text content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// JSON attachment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    /// Exception content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionData>,
    /// Image content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageData>,

    /// State key for upserts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// State value; null deletes the key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_value: Option<Value>,

    /// Session lifecycle action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_action: Option<SessionAction>,

    /// Group identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Group action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_action: Option<GroupAction>,
    /// Group display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_label: Option<String>,

    /// RPC correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_id: Option<String>,
    /// RPC direction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_direction: Option<RpcDirection>,
    /// RPC method name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_method: Option<String>,
    /// RPC arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_args: Option<Value>,
    /// RPC result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_response: Option<Value>,
    /// RPC failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_error: Option<String>,
}

impl LogEntry {
    /// Create a new entry with a fresh id and the current timestamp
    pub fn new(
        session_id: impl Into<String>,
        severity: Severity,
        kind: EntryType,
        application: ApplicationInfo,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            timestamp: Utc::now(),
            severity,
            kind,
            application,
            section: None,
            tags: None,
            replace: false,
            text: None,
            json: None,
            exception: None,
            image: None,
            state_key: None,
            state_value: None,
            session_action: None,
            group_id: None,
            group_action: None,
            group_label: None,
            rpc_id: None,
            rpc_direction: None,
            rpc_method: None,
            rpc_args: None,
            rpc_response: None,
            rpc_error: None,
        }
    }

    /// Create a text entry
    pub fn text(
        session_id: impl Into<String>,
        severity: Severity,
        application: ApplicationInfo,
        text: impl Into<String>,
    ) -> Self {
        let mut entry = Self::new(session_id, severity, EntryType::Text, application);
        entry.text = Some(text.into());
        entry
    }

    /// Attach tags, replacing any existing ones
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = if tags.is_empty() { None } else { Some(tags) };
        self
    }

    /// Whether this entry carries the result of an RPC call
    pub fn is_rpc_result(&self) -> bool {
        self.kind == EntryType::Rpc
            && matches!(
                self.rpc_direction,
                Some(RpcDirection::Response) | Some(RpcDirection::Error)
            )
    }

    /// Check the limits the server enforces before ingestion
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(LogBeamError::Validation("id cannot be empty".to_string()));
        }
        if self.session_id.is_empty() {
            return Err(LogBeamError::Validation(
                "session_id cannot be empty".to_string(),
            ));
        }
        if self.session_id.chars().count() > MAX_SESSION_ID_LENGTH {
            return Err(LogBeamError::Validation(format!(
                "session_id exceeds {} characters",
                MAX_SESSION_ID_LENGTH
            )));
        }
        if self.tags.as_ref().map_or(0, |t| t.len()) > MAX_TAGS {
            return Err(LogBeamError::Validation(format!(
                "more than {} tags",
                MAX_TAGS
            )));
        }
        Ok(())
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Format as human-readable string
    pub fn to_human_readable(&self) -> String {
        let timestamp = self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f");
        let body = self
            .text
            .as_deref()
            .or_else(|| self.exception.as_ref().map(|e| e.message.as_str()))
            .unwrap_or("");
        format!(
            "{} {} {}: {}",
            timestamp, self.severity, self.application.name, body
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Debug < Severity::Info);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn test_entry_wire_shape() {
        let entry = LogEntry::text("s-1", Severity::Warning, ApplicationInfo::named("api"), "hi");
        let json: Value = serde_json::from_str(&entry.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "text");
        assert_eq!(json["severity"], "warning");
        assert_eq!(json["session_id"], "s-1");
        assert_eq!(json["application"]["name"], "api");
        assert!(json.get("replace").is_none());
        assert!(json.get("rpc_id").is_none());
    }

    #[test]
    fn test_missing_application_defaults_to_unknown() {
        let raw = r#"{"id":"1","session_id":"s","timestamp":"2024-01-01T00:00:00Z","severity":"info","type":"text","text":"x"}"#;
        let entry: LogEntry = serde_json::from_str(raw).unwrap();
        assert_eq!(entry.application.name, "unknown");
        assert!(!entry.replace);
    }

    #[test]
    fn test_validate_limits() {
        let mut entry = LogEntry::text("s", Severity::Info, ApplicationInfo::default(), "x");
        assert!(entry.validate().is_ok());

        entry.session_id = "x".repeat(MAX_SESSION_ID_LENGTH + 1);
        assert!(entry.validate().is_err());

        entry.session_id = String::new();
        assert!(matches!(entry.validate(), Err(LogBeamError::Validation(_))));

        let mut tagged = LogEntry::text("s", Severity::Info, ApplicationInfo::default(), "x");
        let tags: Tags = (0..=MAX_TAGS).map(|i| (format!("k{}", i), "v".to_string())).collect();
        tagged.tags = Some(tags);
        assert!(tagged.validate().is_err());
    }

    #[test]
    fn test_exception_from_error_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let outer = LogBeamError::Io(inner);
        let data = ExceptionData::from_error(&outer);

        assert_eq!(data.message, "I/O error: disk full");
        // thiserror's #[from] exposes the wrapped error as the source
        assert_eq!(data.cause.unwrap().message, "disk full");
    }
}
