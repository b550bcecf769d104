//! logbeam collector server

pub mod hooks;
pub mod http;
pub mod hub;
pub mod ingest;
pub mod rate_limiter;
pub mod ring_buffer;
pub mod rpc_bridge;
pub mod self_logger;
pub mod session_manager;
pub mod socket;
pub mod udp;

use crate::config::ServerConfig;
use crate::types::{ServerMessage, SessionAction};
use crate::{LogBeamError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::future::select_all;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{error, info, warn};

pub use hooks::HookManager;
pub use hub::{BroadcastHub, BroadcastReport, ViewerHandle, ViewerSubscription};
pub use ingest::{EntryStore, IngestOutcome, IngestService};
pub use rate_limiter::{RateLimiter, RateLimiterStats};
pub use ring_buffer::{HistoryPage, HistoryQuery, RingBuffer};
pub use rpc_bridge::{RpcBridge, RpcCallError};
pub use self_logger::SelfLogger;
pub use session_manager::{Session, SessionManager, SYSTEM_SESSION_ID};

/// How long shutdown waits for a listener task before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Components shared by every listener
pub struct ServerContext {
    /// Ingestion pipeline and the registries behind it
    pub ingest: Arc<IngestService>,
    /// Server event logger
    pub self_log: Arc<SelfLogger>,
    pub(crate) connections: Arc<Semaphore>,
    pub(crate) line_limit: usize,
    pub(crate) started: Instant,
    pub(crate) shutdown: broadcast::Sender<()>,
}

/// Main logbeam server that coordinates all components
pub struct LogServer {
    config: ServerConfig,
    ctx: Arc<ServerContext>,
}

impl LogServer {
    /// Create a server with the given configuration
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Create a server forwarding accepted entries to an external store.
    ///
    /// Must be called within a Tokio runtime.
    pub fn with_store(config: ServerConfig, store: Arc<dyn EntryStore>) -> Result<Self> {
        Self::build(config, Some(store))
    }

    fn build(config: ServerConfig, store: Option<Arc<dyn EntryStore>>) -> Result<Self> {
        config.validate()?;

        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.global_rate,
            config.rate_limit.session_rate,
            config.rate_limit.burst_multiplier,
        ));
        let sessions = Arc::new(SessionManager::new());
        let buffer = Arc::new(RingBuffer::new(config.buffer.max_entries, config.buffer.max_bytes));
        let hub = Arc::new(BroadcastHub::new());
        let rpc = Arc::new(RpcBridge::new(Duration::from_secs(config.rpc.timeout_secs)));
        let self_log = Arc::new(SelfLogger::new(buffer.clone(), hub.clone(), sessions.clone()));

        let hooks = Arc::new(HookManager::from_settings(&config.hooks)?);
        let mut ingest = IngestService::new(limiter, sessions, buffer, hub, rpc).with_hooks(hooks);
        if let Some(store) = store {
            ingest = ingest.with_store(store);
        }

        let (shutdown, _) = broadcast::channel(1);
        let ctx = Arc::new(ServerContext {
            ingest: Arc::new(ingest),
            self_log,
            connections: Arc::new(Semaphore::new(config.server.max_connections)),
            line_limit: config.server.buffer_size,
            started: Instant::now(),
            shutdown,
        });

        Ok(Self { config, ctx })
    }

    /// Shared components, for embedding the pipeline without listeners
    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Ingestion pipeline
    pub fn ingest(&self) -> &Arc<IngestService> {
        &self.ctx.ingest
    }

    /// Bind every enabled listener and run them in the background.
    ///
    /// Port 0 binds an ephemeral port; the handle reports the bound addresses.
    pub async fn spawn(&self) -> Result<ServerHandle> {
        let settings = &self.config.server;
        let ctx = &self.ctx;
        let mut tasks = Vec::new();

        let http_listener = bind_tcp(&settings.bind_address, settings.http_port).await?;
        let http_addr = http_listener.local_addr()?;
        let app = http::router(Arc::clone(ctx));
        let mut http_shutdown = ctx.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            axum::serve(http_listener, app)
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown.recv().await;
                })
                .await
                .map_err(|e| LogBeamError::Server(format!("HTTP server failed: {}", e)))
        }));

        let tcp_addr = match settings.tcp_port {
            Some(port) => {
                let listener = bind_tcp(&settings.bind_address, port).await?;
                let addr = listener.local_addr()?;
                tasks.push(tokio::spawn(socket::serve_tcp(
                    listener,
                    Arc::clone(ctx),
                    ctx.shutdown.subscribe(),
                )));
                Some(addr)
            }
            None => None,
        };

        let udp_addr = match settings.udp_port {
            Some(port) => {
                let udp = UdpSocket::bind((settings.bind_address.as_str(), port))
                    .await
                    .map_err(|e| {
                        LogBeamError::Server(format!("Failed to bind UDP port {}: {}", port, e))
                    })?;
                let addr = udp.local_addr()?;
                tasks.push(tokio::spawn(udp::serve_udp(
                    udp,
                    Arc::clone(ctx),
                    ctx.shutdown.subscribe(),
                )));
                Some(addr)
            }
            None => None,
        };

        #[cfg(all(unix, feature = "unix-sockets"))]
        let socket_path = match &settings.socket_path {
            Some(path) => {
                let listener = socket::bind_unix(path)?;
                tasks.push(tokio::spawn(socket::serve_unix(
                    listener,
                    path.clone(),
                    Arc::clone(ctx),
                    ctx.shutdown.subscribe(),
                )));
                Some(path.clone())
            }
            None => None,
        };
        #[cfg(not(all(unix, feature = "unix-sockets")))]
        let socket_path = {
            if settings.socket_path.is_some() {
                warn!("Unix socket listener unavailable on this build, ignoring socket_path");
            }
            None
        };

        tasks.push(tokio::spawn(maintenance(
            Arc::clone(ctx),
            Duration::from_secs(self.config.sessions.check_interval_secs.max(1)),
            Duration::from_secs(self.config.sessions.timeout_secs),
            Duration::from_secs(self.config.rate_limit.bucket_idle_secs),
            ctx.shutdown.subscribe(),
        )));

        ctx.self_log.info(format!("HTTP listening on {}", http_addr));
        if let Some(addr) = tcp_addr {
            ctx.self_log.info(format!("TCP listening on {}", addr));
        }
        if let Some(addr) = udp_addr {
            ctx.self_log.info(format!("UDP listening on {}", addr));
        }
        if let Some(path) = &socket_path {
            ctx.self_log.info(format!("Unix socket listening on {}", path));
        }

        Ok(ServerHandle {
            http_addr,
            tcp_addr,
            udp_addr,
            socket_path,
            shutdown: ctx.shutdown.clone(),
            ctx: Arc::clone(ctx),
            tasks,
        })
    }

    /// Run every listener until [`shutdown`](Self::shutdown) is called
    pub async fn start(&self) -> Result<()> {
        self.spawn().await?.wait().await
    }

    /// Signal every listener to stop
    pub fn shutdown(&self) {
        let _ = self.ctx.shutdown.send(());
    }
}

/// Bound addresses of a running server and its shutdown trigger
pub struct ServerHandle {
    /// HTTP and WebSocket address
    pub http_addr: SocketAddr,
    /// TCP NDJSON address
    pub tcp_addr: Option<SocketAddr>,
    /// UDP address
    pub udp_addr: Option<SocketAddr>,
    /// Unix socket path
    pub socket_path: Option<String>,
    shutdown: broadcast::Sender<()>,
    ctx: Arc<ServerContext>,
    tasks: Vec<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    /// Base URL of the HTTP listener
    pub fn http_url(&self) -> String {
        format!("http://{}", self.http_addr)
    }

    /// URL of the WebSocket stream
    pub fn ws_url(&self) -> String {
        format!("ws://{}/api/v1/stream", self.http_addr)
    }

    /// Stop every listener and wait for them to finish
    pub async fn shutdown(self) -> Result<()> {
        let shutdown_rx = self.shutdown.subscribe();
        let _ = self.shutdown.send(());
        self.join(shutdown_rx).await
    }

    /// Run until shutdown is signalled or a listener exits, then stop the rest
    pub async fn wait(self) -> Result<()> {
        let shutdown_rx = self.shutdown.subscribe();
        self.join(shutdown_rx).await
    }

    async fn join(mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut first_error = None;

        if !self.tasks.is_empty() {
            let early = tokio::select! {
                _ = shutdown_rx.recv() => None,
                (result, index, _) = select_all(self.tasks.iter_mut()) => Some((index, result)),
            };
            if let Some((index, result)) = early {
                self.tasks.remove(index);
                if let Err(e) = flatten(result) {
                    error!("Listener failed: {}", e);
                    first_error = Some(e);
                }
                let _ = self.shutdown.send(());
            }
        }

        for mut task in self.tasks {
            match timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(result) => {
                    if let Err(e) = flatten(result) {
                        error!("Listener failed: {}", e);
                        first_error.get_or_insert(e);
                    }
                }
                Err(_) => {
                    warn!("Listener did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        self.ctx.ingest.rpc().shutdown();
        info!("Server stopped");
        first_error.map_or(Ok(()), Err)
    }
}

fn flatten(result: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    result.map_err(|e| LogBeamError::Server(format!("Listener task failed: {}", e)))?
}

async fn bind_tcp(address: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((address, port))
        .await
        .map_err(|e| LogBeamError::Server(format!("Failed to bind {}:{}: {}", address, port, e)))
}

async fn maintenance(
    ctx: Arc<ServerContext>,
    every: Duration,
    session_timeout: Duration,
    bucket_idle: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_maintenance(&ctx, session_timeout, bucket_idle);
            }
            _ = shutdown_rx.recv() => break,
        }
    }
    Ok(())
}

/// Expire silent sessions and drop idle rate-limit buckets.
///
/// Returns how many sessions expired and how many buckets were pruned.
pub fn run_maintenance(
    ctx: &ServerContext,
    session_timeout: Duration,
    bucket_idle: Duration,
) -> (usize, usize) {
    let ingest = &ctx.ingest;
    let expired = ingest.sessions().expire_inactive(session_timeout);
    for session in &expired {
        ingest.hub().broadcast(&ServerMessage::SessionUpdate {
            session_id: session.session_id.clone(),
            session_action: SessionAction::End,
            application: None,
        });
        ctx.self_log
            .info(format!("Session {} timed out", session.session_id));
    }

    let pruned = ingest.limiter().prune_idle(bucket_idle);
    (expired.len(), pruned)
}
