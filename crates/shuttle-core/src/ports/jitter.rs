//! JitterSource port - 乱数の抽象化
//!
//! # テスト容易性
//! - trait により乱数を差し替え可能
//! - 本番は ThreadRngJitter、テストでは FixedJitter を使用

use rand::Rng;

/// Draws the random amount subtracted from a retry delay.
pub trait JitterSource: Send + Sync {
    /// Uniform draw in `0..=upper_ms`.
    fn draw(&self, upper_ms: u64) -> u64;
}

/// Thread-local RNG backed source.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn draw(&self, upper_ms: u64) -> u64 {
        if upper_ms == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..=upper_ms)
    }
}

/// Deterministic source: always draws `ms`, capped at the upper bound.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub u64);

impl JitterSource for FixedJitter {
    fn draw(&self, upper_ms: u64) -> u64 {
        self.0.min(upper_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_rng_stays_in_range() {
        let jitter = ThreadRngJitter;
        for _ in 0..1_000 {
            assert!(jitter.draw(250) <= 250);
        }
        assert_eq!(jitter.draw(0), 0);
    }

    #[test]
    fn fixed_jitter_is_capped() {
        assert_eq!(FixedJitter(500).draw(100), 100);
        assert_eq!(FixedJitter(50).draw(100), 50);
    }
}
