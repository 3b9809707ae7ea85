//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for [`crate::server::SyncServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub bind_addr: SocketAddr,
    /// HS256 secret used to validate connection tokens (>= 32 bytes)
    pub auth_secret: String,
    /// RocksDB directory; `None` keeps everything in memory
    pub storage_path: Option<PathBuf>,
    /// Per-document broadcast channel capacity
    pub broadcast_capacity: usize,
    /// How long an idle document stays resident before eviction
    pub idle_evict: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".parse().unwrap_or_else(|_| {
                SocketAddr::from(([127, 0, 0, 1], 8765))
            }),
            auth_secret: String::new(),
            storage_path: None,
            broadcast_capacity: 256,
            idle_evict: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Read configuration from `QUILL_*` environment variables, falling back
    /// to defaults for anything unset. `QUILL_AUTH_SECRET` has no default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("QUILL_BIND") {
            if let Ok(parsed) = addr.parse() {
                config.bind_addr = parsed;
            }
        }
        if let Ok(secret) = std::env::var("QUILL_AUTH_SECRET") {
            config.auth_secret = secret;
        }
        if let Ok(path) = std::env::var("QUILL_STORE_PATH") {
            if !path.is_empty() {
                config.storage_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(capacity) = std::env::var("QUILL_BROADCAST_CAPACITY") {
            if let Ok(parsed) = capacity.parse() {
                config.broadcast_capacity = parsed;
            }
        }
        if let Ok(secs) = std::env::var("QUILL_IDLE_EVICT_SECS") {
            if let Ok(parsed) = secs.parse() {
                config.idle_evict = Duration::from_secs(parsed);
            }
        }
        config
    }
}
