//! RPC handlers a client exposes to viewers

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use crate::types::{RpcCategory, RpcDescriptor};

/// Boxed future returned by every handler
pub type RpcFuture = Pin<Box<dyn Future<Output = Result<Value, RpcFailure>> + Send>>;

type HandlerFn = dyn Fn(Value) -> RpcFuture + Send + Sync;

/// Failure reported back to the calling viewer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct RpcFailure(pub String);

impl From<&str> for RpcFailure {
    fn from(message: &str) -> Self {
        RpcFailure(message.to_string())
    }
}

impl From<String> for RpcFailure {
    fn from(message: String) -> Self {
        RpcFailure(message)
    }
}

/// A callable registered under a method name
#[derive(Clone)]
pub struct RpcHandler {
    /// Human-readable description
    pub description: String,
    /// Getter or tool
    pub category: RpcCategory,
    /// JSON schema of the arguments
    pub args_schema: Option<Value>,
    /// Viewer should confirm before calling
    pub confirm: bool,
    handler: Arc<HandlerFn>,
}

impl RpcHandler {
    /// Wrap an async handler
    pub fn new<F, Fut>(description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcFailure>> + Send + 'static,
    {
        Self {
            description: description.into(),
            category: RpcCategory::Getter,
            args_schema: None,
            confirm: false,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    /// Wrap a synchronous handler
    pub fn sync<F>(description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Result<Value, RpcFailure> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(description, move |args| {
            let handler = handler.clone();
            async move { handler(args) }
        })
    }

    /// Set the category
    pub fn with_category(mut self, category: RpcCategory) -> Self {
        self.category = category;
        self
    }

    /// Set the argument schema
    pub fn with_args_schema(mut self, schema: Value) -> Self {
        self.args_schema = Some(schema);
        self
    }

    /// Require viewer confirmation
    pub fn with_confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    /// Invoke the handler
    pub fn call(&self, args: Value) -> RpcFuture {
        (self.handler)(args)
    }
}

impl std::fmt::Debug for RpcHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcHandler")
            .field("description", &self.description)
            .field("category", &self.category)
            .field("confirm", &self.confirm)
            .finish_non_exhaustive()
    }
}

/// Name-keyed table of handlers
#[derive(Debug, Default)]
pub struct RpcRegistry {
    handlers: RwLock<HashMap<String, RpcHandler>>,
}

impl RpcRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any existing one with the same name
    pub fn register(&self, name: impl Into<String>, handler: RpcHandler) {
        self.handlers.write().insert(name.into(), handler);
    }

    /// Remove a handler; returns whether it existed
    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.write().remove(name).is_some()
    }

    /// Whether a handler is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Clone of the handler registered under `name`
    pub fn get(&self, name: &str) -> Option<RpcHandler> {
        self.handlers.read().get(name).cloned()
    }

    /// Metadata of all handlers, sorted by name
    pub fn descriptors(&self) -> Vec<RpcDescriptor> {
        let mut descriptors: Vec<RpcDescriptor> = self
            .handlers
            .read()
            .iter()
            .map(|(name, handler)| RpcDescriptor {
                name: name.clone(),
                description: handler.description.clone(),
                category: handler.category,
                args_schema: handler.args_schema.clone(),
                confirm: handler.confirm,
            })
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Number of handlers
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Whether no handlers are registered
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sync_and_async_handlers() {
        let double = RpcHandler::sync("double", |args| {
            let n = args.as_i64().ok_or("expected a number")?;
            Ok(json!(n * 2))
        });
        assert_eq!(double.call(json!(21)).await.unwrap(), json!(42));
        assert_eq!(
            double.call(json!("x")).await.unwrap_err(),
            RpcFailure::from("expected a number")
        );

        let echo = RpcHandler::new("echo", |args| async move { Ok(args) });
        assert_eq!(echo.call(json!({"a": 1})).await.unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_registry_descriptors() {
        let registry = RpcRegistry::new();
        registry.register(
            "restart",
            RpcHandler::sync("restart worker", |_| Ok(Value::Null))
                .with_category(RpcCategory::Tool)
                .with_confirm(true),
        );
        registry.register(
            "config",
            RpcHandler::sync("current config", |_| Ok(json!({})))
                .with_args_schema(json!({"type": "object"})),
        );

        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].name, "config");
        assert_eq!(descriptors[0].category, RpcCategory::Getter);
        assert!(descriptors[1].confirm);

        let json = serde_json::to_value(&descriptors[1]).unwrap();
        assert_eq!(json["category"], "tool");

        assert!(registry.unregister("config"));
        assert!(!registry.unregister("config"));
        assert!(!registry.contains("config"));
        assert_eq!(registry.len(), 1);
    }
}
