//! InMemoryBroker - 開発・テスト用のブローカー
//!
//! # 学習ポイント
//! - tokio::sync::Mutex + Notify による待ち合わせ（fetch は poll_wait まで待つ）
//! - BinaryHeap（min-heap）で遅延再配送を管理
//! - ロックは await を跨がない（select! の前に必ず解放）

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::{BrokerError, Delivery, Message, MessageId, QueuePolicy, Receipt};
use crate::ports::{BrokerAdapter, BrokerClient, MAX_VISIBILITY_TIMEOUT_SECS};

/// Delayed redelivery entry.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first);
/// `seq` keeps FIFO order between entries due at the same instant.
#[derive(Debug)]
struct ScheduledMessage {
    ready_at: Instant,
    seq: u64,
    message: Message,
}

impl PartialEq for ScheduledMessage {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for ScheduledMessage {}

impl PartialOrd for ScheduledMessage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledMessage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Snapshot of broker bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerCounts {
    pub ready: usize,
    pub scheduled: usize,
    pub in_flight: usize,
    pub acked: usize,
    pub removed: usize,
}

impl BrokerCounts {
    /// Nothing left to deliver and nothing being handled.
    pub fn is_drained(&self) -> bool {
        self.ready == 0 && self.scheduled == 0 && self.in_flight == 0
    }
}

#[derive(Default)]
struct BrokerState {
    ready: VecDeque<Message>,
    scheduled: BinaryHeap<ScheduledMessage>,
    in_flight: HashMap<Receipt, Message>,
    acked: Vec<MessageId>,
    removed: Vec<MessageId>,
    deliveries: HashMap<MessageId, u32>,
    next_receipt: u64,
    next_seq: u64,
}

impl BrokerState {
    /// Move due entries from scheduled to ready.
    fn promote_scheduled(&mut self, now: Instant) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.ready_at > now {
                break; // heap is sorted, so we can stop
            }
            if let Some(entry) = self.scheduled.pop() {
                self.ready.push_back(entry.message);
            }
        }
    }

    fn issue(&mut self, message: Message) -> Delivery {
        self.next_receipt += 1;
        let receipt = Receipt::new(self.next_receipt.to_string());
        *self.deliveries.entry(message.id.clone()).or_default() += 1;
        self.in_flight.insert(receipt.clone(), message.clone());
        Delivery::new(message, receipt)
    }

    fn counts(&self) -> BrokerCounts {
        BrokerCounts {
            ready: self.ready.len(),
            scheduled: self.scheduled.len(),
            in_flight: self.in_flight.len(),
            acked: self.acked.len(),
            removed: self.removed.len(),
        }
    }
}

/// In-memory broker. Cloning shares the same queue.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    max_delay: Duration,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_max_delay(Duration::from_secs(MAX_VISIBILITY_TIMEOUT_SECS))
    }

    pub fn with_max_delay(max_delay: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
            max_delay,
        }
    }

    pub async fn publish(&self, message: Message) {
        self.state.lock().await.ready.push_back(message);
        self.notify.notify_one();
    }

    pub async fn counts(&self) -> BrokerCounts {
        self.state.lock().await.counts()
    }

    /// How many times `id` has been handed out.
    pub async fn deliveries(&self, id: &MessageId) -> u32 {
        self.state
            .lock()
            .await
            .deliveries
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn acked(&self) -> Vec<MessageId> {
        self.state.lock().await.acked.clone()
    }

    pub async fn removed(&self) -> Vec<MessageId> {
        self.state.lock().await.removed.clone()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn open(&self, _queue: &QueuePolicy) -> Result<Box<dyn BrokerAdapter>, BrokerError> {
        Ok(Box::new(InMemoryChannel {
            state: Arc::clone(&self.state),
            notify: Arc::clone(&self.notify),
            max_delay: self.max_delay,
        }))
    }
}

/// Per-poll-loop channel onto an `InMemoryBroker`.
struct InMemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    max_delay: Duration,
}

impl InMemoryChannel {
    async fn settle(&self, delivery: &Delivery) -> Option<Message> {
        self.state.lock().await.in_flight.remove(&delivery.receipt)
    }
}

#[async_trait]
impl BrokerAdapter for InMemoryChannel {
    async fn fetch(&mut self, poll_wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + poll_wait;
        loop {
            let next_wake = {
                let mut state = self.state.lock().await;
                state.promote_scheduled(Instant::now());
                if let Some(message) = state.ready.pop_front() {
                    return Ok(Some(state.issue(message)));
                }
                state.scheduled.peek().map(|entry| entry.ready_at)
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_wake.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let Some(message) = self.settle(delivery).await else {
            return Err(BrokerError::Ack(format!("unknown {}", delivery.receipt)));
        };
        self.state.lock().await.acked.push(message.id);
        Ok(())
    }

    async fn reschedule(
        &mut self,
        delivery: &Delivery,
        retry_attempts: u32,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let Some(mut message) = state.in_flight.remove(&delivery.receipt) else {
            return Err(BrokerError::Reschedule(format!(
                "unknown {}",
                delivery.receipt
            )));
        };
        message.retry_attempts = retry_attempts;

        if delay.is_zero() {
            state.ready.push_back(message);
        } else {
            state.next_seq += 1;
            let seq = state.next_seq;
            state.scheduled.push(ScheduledMessage {
                ready_at: Instant::now() + delay.min(self.max_delay),
                seq,
                message,
            });
        }
        drop(state);

        // Notify outside the lock
        self.notify.notify_one();
        Ok(())
    }

    async fn remove(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        let Some(message) = self.settle(delivery).await else {
            return Err(BrokerError::Remove(format!("unknown {}", delivery.receipt)));
        };
        self.state.lock().await.removed.push(message.id);
        Ok(())
    }

    fn max_delay(&self) -> Duration {
        self.max_delay
    }
}
