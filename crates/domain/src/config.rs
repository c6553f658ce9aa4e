use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResolverConfig {
    /// Number of UDP sockets in the connection pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Local address the pool sockets bind to. Port 0 lets the OS pick
    /// an ephemeral port per socket generation.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// How long a query may stay unanswered before the expiry sweep
    /// resolves it as no-response.
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Interval between full socket-set rotations.
    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,

    /// Delay between rotating a socket out and closing it, so in-flight
    /// reads can drain.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_bind_address() -> String {
    "0.0.0.0:0".to_string()
}

fn default_query_timeout_ms() -> u64 {
    1000
}

fn default_rotation_interval_secs() -> u64 {
    60
}

fn default_grace_period_secs() -> u64 {
    10
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            bind_address: default_bind_address(),
            query_timeout_ms: default_query_timeout_ms(),
            rotation_interval_secs: default_rotation_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

impl ResolverConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}
