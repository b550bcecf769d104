//! Configuration management for logbeam

pub mod settings;

pub use settings::{
    BufferSettings, ClientConfig, HookSettings, RateLimitSettings, RpcSettings, ServerConfig,
    ServerSettings, SessionSettings,
};
