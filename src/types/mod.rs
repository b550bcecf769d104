//! Shared wire and data types

pub mod log_entry;
pub mod message;

pub use log_entry::{
    ApplicationInfo, EntryType, ExceptionData, GroupAction, ImageData, LogEntry, RpcDirection,
    SessionAction, Severity, StackFrame, Tags, MAX_BATCH_SIZE,
};
pub use message::{
    BatchResponse, ClientControl, EntryResult, ErrorCode, HistorySource, QueuedMessage,
    RpcCategory, RpcDescriptor, ServerMessage, SessionInfo, ViewerCommand,
};
