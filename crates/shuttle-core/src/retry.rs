//! Retry backoff: decides redelivery delays.
//!
//! All arithmetic is done on integer milliseconds and clamped before the
//! final conversion to whole seconds, so identical inputs always give
//! identical outputs (no floating point anywhere).

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{BackoffMode, QueuePolicy, WEIGHT_SCALE};
use crate::ports::{JitterSource, ThreadRngJitter};

/// Fixed-point scale applied to delays while the exponential curve is walked.
const PRECISION: u128 = 1_000_000;

/// Delay in milliseconds before jitter, clamped to the policy maximum (backoff
/// path only) and to `ceiling_ms` (always).
///
/// - backoff disabled, or `retry_attempts < grace`: `retry_delay`
/// - otherwise, with `factor = max(retry_attempts - grace, 1)`:
///   - linear: `retry_delay * factor * weight`
///   - exponential: `retry_delay * weight^factor`
///
/// `weight` is `back_off_weight_permille / 1000`.
pub fn backoff_delay_ms(retry_attempts: u32, policy: &QueuePolicy, ceiling_ms: u64) -> u64 {
    let delay_ms = if !policy.allow_retry_back_off || retry_attempts < policy.retry_back_off_grace
    {
        policy.retry_delay_ms
    } else {
        let factor = retry_attempts
            .saturating_sub(policy.retry_back_off_grace)
            .max(1);
        let weight = policy.effective_weight_permille();
        match policy.back_off_mode {
            BackoffMode::Linear => linear_ms(policy.retry_delay_ms, weight, factor),
            BackoffMode::Exponential => {
                exponential_ms(policy.retry_delay_ms, weight, factor, policy.max_retry_delay_ms)
            }
        }
        .min(policy.max_retry_delay_ms)
    };
    delay_ms.min(ceiling_ms)
}

fn linear_ms(delay_ms: u64, weight_permille: u32, factor: u32) -> u64 {
    let raw = u128::from(delay_ms)
        .saturating_mul(u128::from(factor))
        .saturating_mul(u128::from(weight_permille))
        / u128::from(WEIGHT_SCALE);
    u64::try_from(raw).unwrap_or(u64::MAX)
}

// Multiplies step by step and stops once `max_ms` is reached, so large
// factors cost nothing and nothing overflows.
fn exponential_ms(delay_ms: u64, weight_permille: u32, factor: u32, max_ms: u64) -> u64 {
    let cap = u128::from(max_ms) * PRECISION;
    let weight = u128::from(weight_permille);
    let scale = u128::from(WEIGHT_SCALE);
    let mut value = u128::from(delay_ms) * PRECISION;
    if weight > scale {
        for _ in 0..factor {
            if value == 0 || value >= cap {
                break;
            }
            value = value * weight / scale;
        }
    }
    u64::try_from(value.min(cap) / PRECISION).unwrap_or(u64::MAX)
}

/// RetryBackoffCalculator.
///
/// Pure apart from the jitter draw, which goes through a `JitterSource` so
/// tests can pin it.
#[derive(Clone)]
pub struct RetryBackoff {
    jitter: Arc<dyn JitterSource>,
}

impl RetryBackoff {
    pub fn new() -> Self {
        Self::with_jitter(Arc::new(ThreadRngJitter))
    }

    pub fn with_jitter(jitter: Arc<dyn JitterSource>) -> Self {
        Self { jitter }
    }

    /// Delay in whole seconds (truncating) for the given attempt count.
    ///
    /// # Arguments
    /// * `retry_attempts` - attempt number of the upcoming redelivery.
    /// * `policy` - queue policy (delay, grace, weight, mode, max, jitter ratio).
    /// * `ceiling` - broker's absolute ceiling.
    pub fn call(&self, retry_attempts: u32, policy: &QueuePolicy, ceiling: Duration) -> u64 {
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = backoff_delay_ms(retry_attempts, policy, ceiling_ms);

        let ratio = u64::from(policy.effective_jitter_ratio());
        let jitter_ms = if ratio > 0 {
            // delay_ms <= ceiling_ms, so this cannot overflow for any sane ceiling
            self.jitter.draw(delay_ms.saturating_mul(ratio) / 100)
        } else {
            0
        };

        delay_ms.saturating_sub(jitter_ms) / 1000
    }

    pub fn delay(&self, retry_attempts: u32, policy: &QueuePolicy, ceiling: Duration) -> Duration {
        Duration::from_secs(self.call(retry_attempts, policy, ceiling))
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RetryBackoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryBackoff").finish_non_exhaustive()
    }
}
