//! PollLoop - fetch → pipeline → loop
//!
//! # 停止
//! - running フラグ（watch）が false になったらループを抜ける
//! - fetch は待つ可能性があるので select! で running の変化と競合させる
//! - ハンドラ実行中は止めない（in-flight は完了させる）
//!
//! # 失敗
//! - fetch の失敗はログ + on_error。ループは続行
//! - パイプラインから漏れた失敗（ブローカー操作の失敗）は WorkerThreadError
//!   としてこのループを終わらせる（fail-fast）

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::pipeline::MessagePipeline;
use crate::domain::{WorkerFailure, WorkerThreadError};
use crate::ports::BrokerClient;

/// Pause after a failed fetch so a broken broker is not hammered.
const FETCH_ERROR_PAUSE: Duration = Duration::from_millis(500);

/// One poll loop. Owns its broker channel; shares the pipeline.
pub struct PollLoop {
    name: String,
    pipeline: Arc<MessagePipeline>,
    client: Arc<dyn BrokerClient>,
    poll_wait: Duration,
    empty_poll_sleep: Duration,
    gc_flush_interval: u64,
}

impl PollLoop {
    pub fn new(
        name: impl Into<String>,
        pipeline: Arc<MessagePipeline>,
        client: Arc<dyn BrokerClient>,
    ) -> Self {
        Self {
            name: name.into(),
            pipeline,
            client,
            poll_wait: Duration::from_secs(20),
            empty_poll_sleep: Duration::ZERO,
            gc_flush_interval: 0,
        }
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    pub fn with_empty_poll_sleep(mut self, sleep: Duration) -> Self {
        self.empty_poll_sleep = sleep;
        self
    }

    /// Call the adapter's `reclaim` hook every `every` messages (0 = never).
    pub fn with_gc_flush_interval(mut self, every: u64) -> Self {
        self.gc_flush_interval = every;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until `running` turns false (or its sender goes away).
    pub async fn run(self, mut running: watch::Receiver<bool>) -> Result<(), WorkerThreadError> {
        let queue = self.pipeline.queue().name.clone();
        let mut adapter = self.client.open(self.pipeline.queue()).await.map_err(|err| {
            WorkerThreadError::new(self.name.clone(), WorkerFailure::Startup(err.to_string()))
        })?;
        info!(worker = %self.name, queue = %queue, "poll loop started");

        let mut processed: u64 = 0;
        while *running.borrow() {
            let fetched = tokio::select! {
                changed = running.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // 次のループで判定
                    continue;
                }
                fetched = adapter.fetch(self.poll_wait) => fetched,
            };

            match fetched {
                Ok(Some(delivery)) => {
                    let message_id = delivery.id().clone();
                    let resolution = self
                        .pipeline
                        .process(adapter.as_mut(), delivery)
                        .await
                        .map_err(|err| WorkerThreadError::new(self.name.clone(), err))?;
                    debug!(
                        worker = %self.name,
                        message_id = %message_id,
                        ?resolution,
                        removed = resolution.is_final(),
                        "delivery settled"
                    );

                    processed += 1;
                    if self.gc_flush_interval > 0 && processed % self.gc_flush_interval == 0 {
                        adapter.reclaim().await;
                        tokio::task::yield_now().await;
                    }
                }
                Ok(None) => {
                    if !self.empty_poll_sleep.is_zero() {
                        self.pause(&mut running, self.empty_poll_sleep).await;
                    }
                }
                Err(err) => {
                    error!(worker = %self.name, queue = %queue, error = %err, "fetch failed");
                    self.pipeline.fetch_failed(&err);
                    self.pause(&mut running, FETCH_ERROR_PAUSE).await;
                }
            }
        }

        info!(worker = %self.name, processed, "poll loop stopped");
        Ok(())
    }

    // Sleep, but wake early when the running flag changes.
    async fn pause(&self, running: &mut watch::Receiver<bool>, duration: Duration) {
        tokio::select! {
            _ = running.changed() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::handler::MessageHandler;
    use crate::domain::{
        BrokerError, Delivery, HandlerError, Message, MessageArgs, QueuePolicy, Receipt,
    };
    use crate::impls::InMemoryBroker;
    use crate::nonce::NonceManager;
    use crate::ports::BrokerAdapter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting(AtomicU32);

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _content: &[u8], _args: &mut MessageArgs) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn pipeline(handler: Arc<dyn MessageHandler>) -> Arc<MessagePipeline> {
        Arc::new(MessagePipeline::new(
            Arc::new(QueuePolicy::named("q")),
            handler,
            Arc::new(NonceManager::new()),
        ))
    }

    #[tokio::test]
    async fn drains_then_stops_on_flag() {
        let broker = InMemoryBroker::new();
        for i in 0..3 {
            broker
                .publish(Message::new("t", b"".to_vec()).with_id(format!("m-{i}")))
                .await;
        }
        let handler = Arc::new(Counting(AtomicU32::new(0)));
        let poll = PollLoop::new("poller-0", pipeline(handler.clone()), Arc::new(broker.clone()))
            .with_poll_wait(Duration::from_secs(30));

        let (tx, rx) = watch::channel(true);
        let join = tokio::spawn(poll.run(rx));

        while !broker.counts().await.is_drained() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send_replace(false);

        // the long poll is interrupted, not waited out
        tokio::time::timeout(Duration::from_secs(2), join)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(handler.0.load(Ordering::SeqCst), 3);
    }

    /// Fetch always fails; ack never reached.
    struct BrokenClient {
        fetches: Arc<AtomicU32>,
    }

    struct BrokenAdapter {
        fetches: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BrokerClient for BrokenClient {
        async fn open(&self, _queue: &QueuePolicy) -> Result<Box<dyn BrokerAdapter>, BrokerError> {
            Ok(Box::new(BrokenAdapter {
                fetches: Arc::clone(&self.fetches),
            }))
        }
    }

    #[async_trait]
    impl BrokerAdapter for BrokenAdapter {
        async fn fetch(&mut self, _poll_wait: Duration) -> Result<Option<Delivery>, BrokerError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::Fetch("connection reset".into()))
        }

        async fn ack(&mut self, _delivery: &Delivery) -> Result<(), BrokerError> {
            unreachable!()
        }

        async fn reschedule(
            &mut self,
            _delivery: &Delivery,
            _retry_attempts: u32,
            _delay: Duration,
        ) -> Result<(), BrokerError> {
            unreachable!()
        }

        async fn remove(&mut self, _delivery: &Delivery) -> Result<(), BrokerError> {
            unreachable!()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_errors_are_counted_not_fatal() {
        let fetches = Arc::new(AtomicU32::new(0));
        let pipeline = pipeline(Arc::new(Counting(AtomicU32::new(0))));
        let poll = PollLoop::new(
            "poller-0",
            Arc::clone(&pipeline),
            Arc::new(BrokenClient {
                fetches: Arc::clone(&fetches),
            }),
        );

        let (tx, rx) = watch::channel(true);
        let join = tokio::spawn(poll.run(rx));
        tokio::time::sleep(Duration::from_millis(1_250)).await;
        tx.send_replace(false);

        join.await.unwrap().unwrap();
        assert!(fetches.load(Ordering::SeqCst) >= 2);
        assert_eq!(
            pipeline.counts().fetch_errors,
            u64::from(fetches.load(Ordering::SeqCst))
        );
    }

    struct FailingOpen;

    #[async_trait]
    impl BrokerClient for FailingOpen {
        async fn open(&self, _queue: &QueuePolicy) -> Result<Box<dyn BrokerAdapter>, BrokerError> {
            Err(BrokerError::Connect("refused".into()))
        }
    }

    #[tokio::test]
    async fn open_failure_is_a_startup_failure() {
        let poll = PollLoop::new(
            "poller-7",
            pipeline(Arc::new(Counting(AtomicU32::new(0)))),
            Arc::new(FailingOpen),
        );
        let (_tx, rx) = watch::channel(true);
        let err = poll.run(rx).await.unwrap_err();
        assert_eq!(err.worker, "poller-7");
        assert!(matches!(err.cause, WorkerFailure::Startup(_)));
    }

    #[derive(Default)]
    struct Tally {
        fetches: AtomicU32,
        acks: AtomicU32,
        reclaims: AtomicU32,
    }

    /// Hands out `remaining` deliveries, then reports an empty queue at once.
    struct Scripted {
        remaining: u32,
        tally: Arc<Tally>,
    }

    #[async_trait]
    impl BrokerClient for Scripted {
        async fn open(&self, _queue: &QueuePolicy) -> Result<Box<dyn BrokerAdapter>, BrokerError> {
            Ok(Box::new(Scripted {
                remaining: self.remaining,
                tally: Arc::clone(&self.tally),
            }))
        }
    }

    #[async_trait]
    impl BrokerAdapter for Scripted {
        async fn fetch(&mut self, _poll_wait: Duration) -> Result<Option<Delivery>, BrokerError> {
            self.tally.fetches.fetch_add(1, Ordering::SeqCst);
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            let id = format!("m-{}", self.remaining);
            Ok(Some(Delivery::new(
                Message::new("t", b"".to_vec()).with_id(id.clone()),
                Receipt::new(id),
            )))
        }

        async fn ack(&mut self, _delivery: &Delivery) -> Result<(), BrokerError> {
            self.tally.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reschedule(
            &mut self,
            _delivery: &Delivery,
            _retry_attempts: u32,
            _delay: Duration,
        ) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn remove(&mut self, _delivery: &Delivery) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn reclaim(&mut self) {
            self.tally.reclaims.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_every_n_messages() {
        let tally = Arc::new(Tally::default());
        let client = Scripted {
            remaining: 5,
            tally: Arc::clone(&tally),
        };
        let poll = PollLoop::new(
            "poller-0",
            pipeline(Arc::new(Counting(AtomicU32::new(0)))),
            Arc::new(client),
        )
        .with_empty_poll_sleep(Duration::from_millis(10))
        .with_gc_flush_interval(2);

        let (tx, rx) = watch::channel(true);
        let join = tokio::spawn(poll.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send_replace(false);
        join.await.unwrap().unwrap();

        assert_eq!(tally.acks.load(Ordering::SeqCst), 5);
        // after the 2nd and 4th message
        assert_eq!(tally.reclaims.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_poll_sleep_spaces_out_fetches() {
        let tally = Arc::new(Tally::default());
        let client = Scripted {
            remaining: 0,
            tally: Arc::clone(&tally),
        };
        let poll = PollLoop::new(
            "poller-0",
            pipeline(Arc::new(Counting(AtomicU32::new(0)))),
            Arc::new(client),
        )
        .with_empty_poll_sleep(Duration::from_secs(1));

        let (tx, rx) = watch::channel(true);
        let join = tokio::spawn(poll.run(rx));
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        tx.send_replace(false);
        join.await.unwrap().unwrap();

        // t = 0s, 1s, 2s, 3s
        assert_eq!(tally.fetches.load(Ordering::SeqCst), 4);
        assert_eq!(tally.reclaims.load(Ordering::SeqCst), 0);
    }
}
