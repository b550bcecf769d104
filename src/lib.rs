//! # logbeam - Structured Logging Pipeline
//!
//! logbeam moves typed log events from client SDKs to a collector server,
//! which rate-limits them, keeps a bounded in-memory history and fans them
//! out live to connected viewers.
//!
//! ## Features
//!
//! - **Multiple Transports**: WebSocket, HTTP, TCP, UDP and Unix sockets, with
//!   automatic WebSocket to HTTP fallback
//! - **Non-blocking Logging**: a byte-budgeted client queue; logging never fails
//! - **Rate Limiting**: global and per-session token buckets with burst allowance
//! - **Live Viewers**: broadcast hub with per-viewer subscriptions and history replay
//! - **Two-way RPC**: viewers can call handlers registered by running clients
//!
//! ## Quick Start
//!
//! ### Server
//! ```no_run
//! use logbeam::server::LogServer;
//! use logbeam::config::ServerConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::from_file("config/server.toml")?;
//!     let server = LogServer::new(config)?;
//!     server.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Client
//! ```no_run
//! use logbeam::client::Logger;
//! use logbeam::config::ClientConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig {
//!         app: "my-service".to_string(),
//!         ..Default::default()
//!     };
//!     let logger = Logger::new(config).await?;
//!
//!     logger.info("Authentication successful");
//!     logger.close().await;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod server;
pub mod types;

/// Common error types used throughout logbeam
pub mod error {
    use thiserror::Error;

    /// logbeam error types
    #[derive(Debug, Error)]
    pub enum LogBeamError {
        /// I/O operation failed
        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),
        /// Serialization/deserialization failed
        #[error("Serialization error: {0}")]
        Serde(#[from] serde_json::Error),
        /// Configuration error
        #[error("Configuration error: {0}")]
        Config(String),
        /// Server error
        #[error("Server error: {0}")]
        Server(String),
        /// Connection could not be established
        #[error("Connection error: {0}")]
        Connection(String),
        /// Sending over an established transport failed
        #[error("Transport error: {0}")]
        Transport(String),
        /// An inbound entry or batch failed validation
        #[error("Validation error: {0}")]
        Validation(String),
    }

    impl From<::config::ConfigError> for LogBeamError {
        fn from(err: ::config::ConfigError) -> Self {
            LogBeamError::Config(err.to_string())
        }
    }

    /// Result type alias for logbeam operations
    pub type Result<T> = std::result::Result<T, LogBeamError>;
}

pub use error::{LogBeamError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::{Logger, TransportType};
    pub use crate::config::{ClientConfig, ServerConfig};
    pub use crate::server::LogServer;
    pub use crate::types::{LogEntry, QueuedMessage, ServerMessage, Severity};
    pub use crate::{LogBeamError, Result};
}
