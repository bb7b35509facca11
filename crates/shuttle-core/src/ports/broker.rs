//! Broker port - ブローカー固有の fetch/ack/reschedule/remove
//!
//! # 二層構造
//! - **BrokerClient**: 接続情報を持つ transport client（スレッド間で共有）
//! - **BrokerAdapter**: poll ループ 1 本ごとに `open()` されるチャネル（共有しない）
//!
//! パイプラインとスーパーバイザがアダプタを呼ぶだけで、逆方向の呼び出しはありません。

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{BrokerError, Delivery, QueuePolicy};

/// Hard ceiling on redelivery delay most brokers enforce (12h, SQS visibility timeout).
pub const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 43_200;

/// Transport client. Shared by every poll loop; hands each loop its own channel.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Open a channel bound to `queue`. Called once per poll loop.
    async fn open(&self, queue: &QueuePolicy) -> Result<Box<dyn BrokerAdapter>, BrokerError>;
}

/// One poll loop's channel to the broker.
#[async_trait]
pub trait BrokerAdapter: Send {
    /// Next delivery, or `None` once `poll_wait` elapses with nothing to hand out.
    async fn fetch(&mut self, poll_wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Acknowledge: the message is done and leaves the queue.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Redeliver after `delay`, persisting the new attempt count.
    async fn reschedule(
        &mut self,
        delivery: &Delivery,
        retry_attempts: u32,
        delay: Duration,
    ) -> Result<(), BrokerError>;

    /// Remove permanently without success semantics (give-up and drop paths).
    async fn remove(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Absolute ceiling on `reschedule` delays for this broker.
    fn max_delay(&self) -> Duration {
        Duration::from_secs(MAX_VISIBILITY_TIMEOUT_SECS)
    }

    /// Periodic resource-reclaim hint (see `gc_flush_interval`). Advisory.
    async fn reclaim(&mut self) {}
}
