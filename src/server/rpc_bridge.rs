//! Routes viewer RPC calls to the client connection owning a session

use crate::types::{RpcDescriptor, ServerMessage};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

/// Default time a viewer call waits for the client
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Why an RPC call produced no result
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcCallError {
    /// No client connection owns the target session
    #[error("Session \"{0}\" not found")]
    TargetNotFound(String),
    /// The target published its handlers and this is not one of them
    #[error("Unknown RPC method: {0}")]
    UnknownMethod(String),
    /// The client did not answer in time
    #[error("RPC timeout after {0:?}")]
    Timeout(Duration),
    /// The client's handler reported a failure
    #[error("{0}")]
    Remote(String),
}

/// Outbound channel of a connected client
pub type ClientSender = mpsc::Sender<ServerMessage>;

/// Pending-call table plus the client connections calls are routed to
#[derive(Debug)]
pub struct RpcBridge {
    clients: DashMap<String, ClientSender>,
    tools: DashMap<String, Vec<RpcDescriptor>>,
    pending: DashMap<String, oneshot::Sender<Result<Value, String>>>,
    timeout: Duration,
}

impl Default for RpcBridge {
    fn default() -> Self {
        Self::new(DEFAULT_RPC_TIMEOUT)
    }
}

impl RpcBridge {
    /// Create a bridge with the given call timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            tools: DashMap::new(),
            pending: DashMap::new(),
            timeout,
        }
    }

    /// Route calls for `session_id` to `sender`
    pub fn register_client(&self, session_id: impl Into<String>, sender: ClientSender) {
        self.clients.insert(session_id.into(), sender);
    }

    /// Stop routing calls for `session_id` and forget its handlers
    pub fn unregister_client(&self, session_id: &str) {
        self.clients.remove(session_id);
        self.tools.remove(session_id);
    }

    /// Stop routing calls for `session_id` if `sender` still owns it.
    ///
    /// A reconnecting client may already have registered a new connection.
    pub fn release_client(&self, session_id: &str, sender: &ClientSender) {
        let released = self
            .clients
            .remove_if(session_id, |_, current| current.same_channel(sender))
            .is_some();
        if released {
            self.tools.remove(session_id);
        }
    }

    /// Replace the handlers published by `session_id`
    pub fn register_tools(&self, session_id: impl Into<String>, tools: Vec<RpcDescriptor>) {
        self.tools.insert(session_id.into(), tools);
    }

    /// Handlers published by `session_id`, if it published any
    pub fn tools(&self, session_id: &str) -> Option<Vec<RpcDescriptor>> {
        self.tools.get(session_id).map(|entry| entry.value().clone())
    }

    /// Handlers of every session that published them
    pub fn all_tools(&self) -> BTreeMap<String, Vec<RpcDescriptor>> {
        self.tools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Whether a client connection owns `session_id`
    pub fn has_client(&self, session_id: &str) -> bool {
        self.clients.contains_key(session_id)
    }

    /// Call `method` on the client owning `target_session` with a fresh id
    pub async fn call(
        &self,
        target_session: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, RpcCallError> {
        let rpc_id = Uuid::new_v4().to_string();
        self.call_with_id(&rpc_id, target_session, method, args).await
    }

    /// Call `method` using a caller-chosen correlation id.
    ///
    /// A target that published its handlers is only sent methods it listed.
    pub async fn call_with_id(
        &self,
        rpc_id: &str,
        target_session: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, RpcCallError> {
        let sender = self
            .clients
            .get(target_session)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RpcCallError::TargetNotFound(target_session.to_string()))?;

        if let Some(tools) = self.tools.get(target_session) {
            if !tools.iter().any(|tool| tool.name == method) {
                return Err(RpcCallError::UnknownMethod(method.to_string()));
            }
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(rpc_id.to_string(), tx);

        let request = ServerMessage::RpcRequest {
            rpc_id: rpc_id.to_string(),
            rpc_method: method.to_string(),
            rpc_args: args,
        };

        let outcome = timeout(self.timeout, async {
            if sender.send(request).await.is_err() {
                return Err(RpcCallError::TargetNotFound(target_session.to_string()));
            }
            match rx.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(message)) => Err(RpcCallError::Remote(message)),
                Err(_) => Err(RpcCallError::TargetNotFound(target_session.to_string())),
            }
        })
        .await;

        self.pending.remove(rpc_id);
        match outcome {
            Ok(result) => result,
            Err(_) => {
                debug!("RPC {} to {} timed out", rpc_id, target_session);
                Err(RpcCallError::Timeout(self.timeout))
            }
        }
    }

    /// Deliver a client's result; returns whether a call was waiting for it
    pub fn complete(&self, rpc_id: &str, result: Result<Value, String>) -> bool {
        match self.pending.remove(rpc_id) {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Number of calls awaiting a result
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop every pending call; waiting callers see `TargetNotFound`
    pub fn shutdown(&self) {
        self.pending.clear();
    }
}
