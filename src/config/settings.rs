//! Configuration structures for logbeam

use crate::client::TransportType;
use crate::{LogBeamError, Result};
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefix for environment overrides, e.g. `LOGBEAM__SERVER__HTTP_PORT=9000`
const ENV_PREFIX: &str = "LOGBEAM";

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener settings
    pub server: ServerSettings,
    /// Ring buffer sizing
    pub buffer: BufferSettings,
    /// Rate limiting
    pub rate_limit: RateLimitSettings,
    /// Session liveness
    pub sessions: SessionSettings,
    /// RPC bridge
    pub rpc: RpcSettings,
    /// Ingestion hooks
    pub hooks: HookSettings,
}

/// Core listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address every listener binds to
    pub bind_address: String,
    /// HTTP and WebSocket port
    pub http_port: u16,
    /// TCP NDJSON port, `None` disables the listener
    pub tcp_port: Option<u16>,
    /// UDP datagram port, `None` disables the listener
    pub udp_port: Option<u16>,
    /// Unix socket path, `None` disables the listener
    pub socket_path: Option<String>,
    /// Maximum concurrent stream connections
    pub max_connections: usize,
    /// Receive buffer size for datagrams and line reads
    pub buffer_size: usize,
}

/// Ring buffer sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Maximum retained entries
    pub max_entries: usize,
    /// Maximum estimated bytes retained
    pub max_bytes: usize,
}

/// Rate limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Tokens per second shared by all sessions
    pub global_rate: f64,
    /// Tokens per second per session
    pub session_rate: f64,
    /// Capacity multiplier applied to both rates
    pub burst_multiplier: f64,
    /// Idle time after which a session bucket is dropped
    pub bucket_idle_secs: u64,
}

/// Session liveness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Heartbeat silence after which a session is marked inactive
    pub timeout_secs: u64,
    /// Interval of the maintenance sweep
    pub check_interval_secs: u64,
}

/// RPC bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    /// How long a viewer call waits for the client
    pub timeout_secs: u64,
}

/// Built-in ingestion hooks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookSettings {
    /// Regular expressions whose matches are replaced with `[REDACTED]`
    pub redact_patterns: Vec<String>,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server URL for WebSocket/HTTP transports
    pub url: String,
    /// Server host for TCP/UDP transports
    pub host: String,
    /// Server port for the TCP transport
    pub port: u16,
    /// Server port for the UDP transport
    pub udp_port: u16,
    /// Server socket path for the Unix transport
    pub socket_path: String,
    /// Transport selection
    pub transport: TransportType,
    /// Application name
    pub app: String,
    /// Application version
    pub version: Option<String>,
    /// Deployment environment
    pub environment: String,
    /// Fixed session id; a random one is generated when unset
    pub session_id: Option<String>,
    /// Byte budget of the outgoing queue
    pub max_queue_bytes: usize,
    /// Maximum entries per send
    pub batch_size: usize,
    /// Interval between queue drains in milliseconds
    pub drain_interval_ms: u64,
    /// Connection timeout in seconds
    pub timeout_seconds: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            http_port: 8080,
            tcp_port: Some(8082),
            udp_port: Some(8081),
            socket_path: None,
            max_connections: 1000,
            buffer_size: 65536,
        }
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            max_entries: 1_000_000,
            max_bytes: 256 * 1024 * 1024, // 256MB
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            global_rate: 10_000.0,
            session_rate: 1_000.0,
            burst_multiplier: 2.0,
            bucket_idle_secs: 600,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            check_interval_secs: 60,
        }
    }
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/api/v1/stream".to_string(),
            host: "localhost".to_string(),
            port: 8082,
            udp_port: 8081,
            socket_path: "/tmp/logbeam.sock".to_string(),
            transport: TransportType::Auto,
            app: "unknown".to_string(),
            version: None,
            environment: "dev".to_string(),
            session_id: None,
            max_queue_bytes: 8 * 1024 * 1024, // 8MB
            batch_size: 100,
            drain_interval_ms: 100,
            timeout_seconds: 5,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file, then apply `LOGBEAM__*` overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LogBeamError::Config(format!(
                "Failed to read config file: {} does not exist",
                path.display()
            )));
        }

        let config: ServerConfig = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults with `LOGBEAM__*` environment overrides applied
    pub fn from_env() -> Result<Self> {
        let config: ServerConfig = Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.bind_address.is_empty() {
            return Err(LogBeamError::Config("Bind address cannot be empty".to_string()));
        }
        if self.buffer.max_entries == 0 {
            return Err(LogBeamError::Config("Buffer capacity must be positive".to_string()));
        }
        if self.rate_limit.global_rate <= 0.0 || self.rate_limit.session_rate <= 0.0 {
            return Err(LogBeamError::Config("Rate limits must be positive".to_string()));
        }
        if self.rate_limit.burst_multiplier < 1.0 {
            return Err(LogBeamError::Config(
                "Burst multiplier must be at least 1".to_string(),
            ));
        }
        if matches!(&self.server.socket_path, Some(path) if path.is_empty()) {
            return Err(LogBeamError::Config("Socket path cannot be empty".to_string()));
        }
        crate::server::hooks::compile_patterns(&self.hooks.redact_patterns)?;
        Ok(())
    }
}

impl ClientConfig {
    /// Defaults with `LOGBEAM__*` environment overrides applied
    pub fn from_env() -> Result<Self> {
        let config: ClientConfig = Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.app.is_empty() {
            return Err(LogBeamError::Config("Application name cannot be empty".to_string()));
        }
        if matches!(self.transport, TransportType::Auto | TransportType::Ws | TransportType::Http)
            && self.url.is_empty()
        {
            return Err(LogBeamError::Config("Server URL cannot be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(LogBeamError::Config("Batch size must be positive".to_string()));
        }
        Ok(())
    }
}
