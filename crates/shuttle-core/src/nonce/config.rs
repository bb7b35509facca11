//! Nonce store configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where the dedup store lives and how the lock behaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    /// Store endpoint, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,

    /// Connect and per-command timeout (ms).
    pub timeout_ms: u64,

    /// How long a lock (and the post-success marker) lives.
    pub lifespan_secs: u64,

    pub pool_size: usize,

    /// Max wait for a free pooled connection (ms).
    pub pool_timeout_ms: u64,
}

impl NonceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn lifespan(&self) -> Duration {
        Duration::from_secs(self.lifespan_secs)
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            timeout_ms: 1_000,
            lifespan_secs: 60,
            pool_size: 5,
            pool_timeout_ms: 5_000,
        }
    }
}
