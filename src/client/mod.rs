//! logbeam client implementation

pub mod logger;
pub mod queue;
pub mod rpc;
pub mod session;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use logger::Logger;
pub use queue::LogQueue;
pub use rpc::{RpcCategory, RpcDescriptor, RpcFailure, RpcHandler, RpcRegistry};
pub use session::{DrainBackoff, DrainOutcome};
pub use transport::{create_transport, SendReport, TransportAdapter, TransportOptions};

/// Transport selection for a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// WebSocket first, HTTP if that fails
    #[default]
    Auto,
    /// WebSocket
    Ws,
    /// HTTP POST
    Http,
    /// NDJSON over TCP
    Tcp,
    /// JSON datagrams over UDP
    Udp,
    /// NDJSON over a Unix domain socket
    Unix,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportType::Auto => "auto",
            TransportType::Ws => "ws",
            TransportType::Http => "http",
            TransportType::Tcp => "tcp",
            TransportType::Udp => "udp",
            TransportType::Unix => "unix",
        };
        f.write_str(name)
    }
}
