//! Transforms applied to entries on their way into the server
//!
//! Hooks run in three phases:
//!
//! * pre-validate: on the raw JSON item, before it is decoded
//! * post-validate: on the decoded entry, before it is stored
//! * post-store: observers of each stored entry
//!
//! Hooks of a phase run in registration order.

use crate::config::HookSettings;
use crate::types::LogEntry;
use crate::{LogBeamError, Result};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

/// Replacement for redacted text
pub const REDACTED: &str = "[REDACTED]";

/// Rewrites a raw item before decoding
pub type PreValidateHook = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Rewrites a decoded entry before storage
pub type PostValidateHook = Arc<dyn Fn(LogEntry) -> LogEntry + Send + Sync>;

/// Observes a stored entry
pub type PostStoreHook = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// Registered hooks of every phase
#[derive(Default)]
pub struct HookManager {
    pre_validate: RwLock<Vec<PreValidateHook>>,
    post_validate: RwLock<Vec<PostValidateHook>>,
    post_store: RwLock<Vec<PostStoreHook>>,
}

impl HookManager {
    /// Create a manager with no hooks
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a manager with the built-in hooks enabled by `settings`
    pub fn from_settings(settings: &HookSettings) -> Result<Self> {
        let manager = Self::new();
        if !settings.redact_patterns.is_empty() {
            manager.on_post_validate(redact_hook(&settings.redact_patterns)?);
        }
        Ok(manager)
    }

    /// Register a pre-validate hook
    pub fn on_pre_validate(&self, hook: PreValidateHook) {
        self.pre_validate.write().push(hook);
    }

    /// Register a post-validate hook
    pub fn on_post_validate(&self, hook: PostValidateHook) {
        self.post_validate.write().push(hook);
    }

    /// Register a post-store hook
    pub fn on_post_store(&self, hook: PostStoreHook) {
        self.post_store.write().push(hook);
    }

    /// Run every pre-validate hook over a raw item
    pub fn run_pre_validate(&self, raw: Value) -> Value {
        let hooks = self.pre_validate.read().clone();
        hooks.iter().fold(raw, |raw, hook| hook(raw))
    }

    /// Run every post-validate hook over an entry
    pub fn run_post_validate(&self, entry: LogEntry) -> LogEntry {
        let hooks = self.post_validate.read().clone();
        hooks.iter().fold(entry, |entry, hook| hook(entry))
    }

    /// Notify every post-store hook
    pub fn run_post_store(&self, entry: &LogEntry) {
        let hooks = self.post_store.read().clone();
        for hook in &hooks {
            hook(entry);
        }
    }

    /// Number of registered hooks across all phases
    pub fn len(&self) -> usize {
        self.pre_validate.read().len() + self.post_validate.read().len() + self.post_store.read().len()
    }

    /// Whether no hooks are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookManager")
            .field("pre_validate", &self.pre_validate.read().len())
            .field("post_validate", &self.post_validate.read().len())
            .field("post_store", &self.post_store.read().len())
            .finish()
    }
}

/// Compile `patterns` into a hook replacing every match in an entry's text
/// and exception message with [`REDACTED`]
pub fn redact_hook(patterns: &[String]) -> Result<PostValidateHook> {
    let regexes = compile_patterns(patterns)?;
    Ok(Arc::new(move |mut entry: LogEntry| {
        if let Some(text) = entry.text.take() {
            entry.text = Some(redact(&regexes, text));
        }
        if let Some(exception) = entry.exception.as_mut() {
            let message = std::mem::take(&mut exception.message);
            exception.message = redact(&regexes, message);
        }
        entry
    }))
}

/// Compile redaction patterns, naming the first invalid one
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|e| {
                LogBeamError::Config(format!("Invalid redact pattern {:?}: {}", pattern, e))
            })
        })
        .collect()
}

fn redact(regexes: &[Regex], text: String) -> String {
    regexes.iter().fold(text, |text, re| {
        if re.is_match(&text) {
            re.replace_all(&text, REDACTED).into_owned()
        } else {
            text
        }
    })
}
