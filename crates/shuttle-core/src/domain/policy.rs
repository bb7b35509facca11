//! Queue policy: the retry/backoff knobs a worker pool runs against.
//!
//! A `QueuePolicy` is built by the caller before `WorkerSupervisor::start` and
//! is shared read-only (`Arc<QueuePolicy>`) by every poll loop afterwards.

use serde::{Deserialize, Serialize};

/// `back_off_weight_permille` value meaning a weight of 1.
pub const WEIGHT_SCALE: u32 = 1_000;

/// Growth curve once the backoff grace is used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffMode {
    /// `retry_delay * factor * weight`
    #[default]
    Linear,
    /// `retry_delay * weight^factor`
    Exponential,
}

/// Retry/backoff policy of one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuePolicy {
    pub name: String,

    pub allow_retry: bool,

    /// Deliveries that may fail before the message is given up.
    pub max_retry_attempts: u32,

    /// Fixed redelivery delay (ms).
    pub retry_delay_ms: u64,

    pub allow_retry_back_off: bool,

    /// Multiplier (linear) or base (exponential), in thousandths:
    /// 1000 = 1.0, 1500 = 1.5. Values below 1000 are treated as 1000.
    pub back_off_weight_permille: u32,

    pub back_off_mode: BackoffMode,

    /// Upper bound for backoff delays (ms).
    pub max_retry_delay_ms: u64,

    /// Attempts served at the fixed delay before backoff kicks in.
    pub retry_back_off_grace: u32,

    /// Percentage (0..=100) of the computed delay that may be shaved off at random.
    pub jitter_ratio: u8,

    /// Broker-side redrive threshold. Passed through to adapters only.
    pub max_receive_count: u32,

    pub require_signature: bool,

    /// Adapter-specific dead-letter target.
    pub dead_letter: Option<String>,
}

impl QueuePolicy {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn effective_weight_permille(&self) -> u32 {
        self.back_off_weight_permille.max(WEIGHT_SCALE)
    }

    pub fn effective_jitter_ratio(&self) -> u8 {
        self.jitter_ratio.min(100)
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            allow_retry: true,
            max_retry_attempts: 5,
            retry_delay_ms: 30_000,
            allow_retry_back_off: false,
            back_off_weight_permille: WEIGHT_SCALE,
            back_off_mode: BackoffMode::Linear,
            max_retry_delay_ms: 3_600_000,
            retry_back_off_grace: 0,
            jitter_ratio: 0,
            max_receive_count: 10,
            require_signature: false,
            dead_letter: None,
        }
    }
}
