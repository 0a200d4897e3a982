use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 9000;

/// Connection configuration: where to connect, who to authenticate as, how
/// much work may be in flight and how quickly the breaker gives up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,

    /// Enqueue cap on the number of queued requests.
    pub max_inflight_requests: usize,
    /// Enqueue cap on the total encoded bytes of queued requests.
    pub max_inflight_bytes: usize,
    /// Capacity of the receive ring.
    pub inbox_ring_bytes: usize,

    /// Trip the breaker when a connect is still pending after this long.
    pub connect_timeout: Duration,
    /// Trip the breaker when an active phase makes no progress for this long.
    pub stall_timeout: Duration,
    /// How long the breaker keeps the connection disabled after a failure.
    pub cooldown: Duration,
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            database: "default".to_string(),
            user: "default".to_string(),
            password: String::new(),
            max_inflight_requests: 64,
            max_inflight_bytes: 16 * 1024 * 1024,
            inbox_ring_bytes: 1024 * 1024,
            connect_timeout: Duration::from_secs(2),
            stall_timeout: Duration::from_secs(2),
            cooldown: Duration::from_secs(5),
        }
    }
}

impl ClientOptions {
    pub fn load<P: AsRef<Path>>(path: P) -> ClientOptions {
        serdeconv::from_toml_file(path).expect("Error loading client configuration file")
    }
}
