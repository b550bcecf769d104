//! logbeam Server Binary
//!
//! Collects structured log entries and fans them out to live viewers.

use clap::Parser;
use logbeam::config::ServerConfig;
use logbeam::server::LogServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "logbeam-server")]
#[command(about = "Structured logging collector with live viewer fan-out")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Address every listener binds to
    #[arg(short, long)]
    bind: Option<String>,

    /// HTTP and WebSocket port
    #[arg(long)]
    http_port: Option<u16>,

    /// TCP NDJSON port
    #[arg(long)]
    tcp_port: Option<u16>,

    /// UDP datagram port
    #[arg(long)]
    udp_port: Option<u16>,

    /// Unix socket path to listen on
    #[arg(short, long)]
    socket: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if args.verbose {
            "logbeam=debug,info"
        } else {
            "logbeam=info,warn"
        })
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    if args.json {
        builder.json().init();
    } else {
        builder.init();
    }

    info!("Starting logbeam server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if args.config.exists() {
        ServerConfig::from_file(&args.config)?
    } else {
        info!("Config file not found, using defaults and environment");
        ServerConfig::from_env()?
    };

    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(port) = args.http_port {
        config.server.http_port = port;
    }
    if let Some(port) = args.tcp_port {
        config.server.tcp_port = Some(port);
    }
    if let Some(port) = args.udp_port {
        config.server.udp_port = Some(port);
    }
    if let Some(socket) = args.socket {
        config.server.socket_path = Some(socket);
    }

    config.validate()?;

    info!("Buffer capacity: {} entries", config.buffer.max_entries);
    info!(
        "Rate limits: {}/s global, {}/s per session, burst x{}",
        config.rate_limit.global_rate,
        config.rate_limit.session_rate,
        config.rate_limit.burst_multiplier
    );

    let server = Arc::new(LogServer::new(config)?);
    let handle = server.spawn().await?;
    info!("HTTP on {}", handle.http_url());

    let signal_server = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutting down gracefully...");
        signal_server.shutdown();
    });

    if let Err(e) = handle.wait().await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("logbeam server stopped");
    Ok(())
}
