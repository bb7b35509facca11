//! MessagePipeline - 1 配送ぶんの状態機械
//!
//! # フロー
//! 1. 署名検証（キューが要求する場合）。失敗したらハンドラを呼ばずに reject
//! 2. dedup ロック。取れなければ Duplicate として ack（ハンドラは呼ばない）
//! 3. ハンドラ実行（別タスクで実行し、panic もここで止める）
//! 4. 解決
//!    - 成功かつ abort なし → complete + ack（drop なら remove）
//!    - 失敗 / abort → failed + (remove | reschedule)
//!
//! ハンドラ・署名・dedup ストアの失敗はすべて reject 経路に流れます。
//! ブローカー操作（ack / reschedule / remove）の失敗だけが `Err` で外に出ます。

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::handler::{Callbacks, MessageHandler};
use crate::domain::{
    BrokerError, Delivery, Message, MessageArgs, ProcessingError, QueuePolicy, Resolution,
};
use crate::nonce::NonceManager;
use crate::observability::PipelineCounts;
use crate::ports::{BrokerAdapter, SignatureVerifier};
use crate::retry::RetryBackoff;

pub struct MessagePipeline {
    queue: Arc<QueuePolicy>,
    handler: Arc<dyn MessageHandler>,
    nonce: Arc<NonceManager>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    callbacks: Callbacks,
    backoff: RetryBackoff,
    counts: Arc<Mutex<PipelineCounts>>,
}

impl MessagePipeline {
    pub fn new(
        queue: Arc<QueuePolicy>,
        handler: Arc<dyn MessageHandler>,
        nonce: Arc<NonceManager>,
    ) -> Self {
        Self {
            queue,
            handler,
            nonce,
            verifier: None,
            callbacks: Callbacks::default(),
            backoff: RetryBackoff::default(),
            counts: Arc::default(),
        }
    }

    pub fn with_verifier(mut self, verifier: Option<Arc<dyn SignatureVerifier>>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Share a counter block (the supervisor hands one to every pipeline).
    pub fn with_counts(mut self, counts: Arc<Mutex<PipelineCounts>>) -> Self {
        self.counts = counts;
        self
    }

    pub fn queue(&self) -> &QueuePolicy {
        &self.queue
    }

    pub fn counts(&self) -> PipelineCounts {
        self.lock_counts().clone()
    }

    /// Settle one delivery against `adapter`.
    ///
    /// # Errors
    /// Only broker failures while acknowledging, removing or rescheduling.
    /// Everything else is absorbed into the returned `Resolution`.
    pub async fn process(
        &self,
        adapter: &mut dyn BrokerAdapter,
        delivery: Delivery,
    ) -> Result<Resolution, BrokerError> {
        let message = &delivery.message;

        // 1) 署名（ロックを取る前に見るので failed() は呼ばない）
        if let Err(err) = self.verify_signature(message) {
            return self.reject(adapter, &delivery, err, false, false).await;
        }

        // 2) dedup
        match self.nonce.lock(&message.id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    message_id = %message.id,
                    queue = %self.queue.name,
                    "duplicate delivery, acknowledging without handling"
                );
                adapter.ack(&delivery).await?;
                return Ok(self.settle(Resolution::Duplicate));
            }
            Err(err) => {
                return self.reject(adapter, &delivery, err.into(), false, false).await;
            }
        }

        // 3) dispatch
        let (outcome, args) = self.dispatch(message).await;

        // 4) resolution
        match outcome {
            Ok(()) if !args.abort => self.accept(adapter, &delivery, args.drop).await,
            Ok(()) => {
                self.reject(adapter, &delivery, ProcessingError::Aborted, true, args.drop)
                    .await
            }
            Err(err) => self.reject(adapter, &delivery, err, true, args.drop).await,
        }
    }

    /// Count a fetch failure and hand it to `on_error`.
    pub fn fetch_failed(&self, err: &BrokerError) {
        self.lock_counts().fetch_errors += 1;
        self.callbacks.error(err, None);
    }

    fn verify_signature(&self, message: &Message) -> Result<(), ProcessingError> {
        if !self.queue.require_signature {
            return Ok(());
        }
        let valid = match (&message.signature, &self.verifier) {
            (Some(signature), Some(verifier)) => verifier.verify(message, signature),
            _ => false,
        };
        if valid {
            Ok(())
        } else {
            Err(ProcessingError::InvalidSignature(message.id.clone()))
        }
    }

    /// Run the handler on its own task so a panic stays inside the pipeline.
    async fn dispatch(&self, message: &Message) -> (Result<(), ProcessingError>, MessageArgs) {
        let handler = Arc::clone(&self.handler);
        let content = message.content.clone();
        let mut args = MessageArgs::from_message(message);
        let fallback = args.clone();

        let joined = tokio::spawn(async move {
            let result = handler
                .handle(&content, &mut args)
                .await
                .map_err(|err| ProcessingError::Handler(err.to_string()));
            (result, args)
        })
        .await;

        match joined {
            Ok(pair) => pair,
            Err(err) if err.is_panic() => (Err(ProcessingError::HandlerPanicked), fallback),
            Err(_) => (
                Err(ProcessingError::Handler("handler task cancelled".to_string())),
                fallback,
            ),
        }
    }

    async fn accept(
        &self,
        adapter: &mut dyn BrokerAdapter,
        delivery: &Delivery,
        drop: bool,
    ) -> Result<Resolution, BrokerError> {
        let message = &delivery.message;
        if let Err(err) = self.nonce.complete(&message.id).await {
            return self.reject(adapter, delivery, err.into(), true, drop).await;
        }

        if drop {
            adapter.remove(delivery).await?;
            debug!(message_id = %message.id, "handled and dropped");
            return Ok(self.settle(Resolution::Dropped));
        }

        adapter.ack(delivery).await?;
        debug!(message_id = %message.id, "accepted");
        Ok(self.settle(Resolution::Accepted))
    }

    /// Reject path. `lock_held` is false when we never took the dedup lock.
    async fn reject(
        &self,
        adapter: &mut dyn BrokerAdapter,
        delivery: &Delivery,
        err: ProcessingError,
        lock_held: bool,
        drop: bool,
    ) -> Result<Resolution, BrokerError> {
        let message = &delivery.message;
        let policy = &*self.queue;
        info!(
            message_id = %message.id,
            queue = %policy.name,
            retry_attempts = message.retry_attempts,
            error = %err,
            "message rejected"
        );
        self.callbacks.error(&err, Some(message));

        if lock_held && let Err(release) = self.nonce.failed(&message.id).await {
            warn!(message_id = %message.id, error = %release, "failed to release nonce lock");
        }

        if drop {
            adapter.remove(delivery).await?;
            return Ok(self.settle(Resolution::Dropped));
        }

        if !policy.allow_retry {
            adapter.remove(delivery).await?;
            return Ok(self.settle(Resolution::Discarded));
        }

        if message.retry_attempts >= policy.max_retry_attempts {
            adapter.remove(delivery).await?;
            warn!(
                message_id = %message.id,
                queue = %policy.name,
                retry_attempts = message.retry_attempts,
                max_retry_attempts = policy.max_retry_attempts,
                "retry limit exceeded, message removed"
            );
            self.callbacks.retry_exceeded(message);
            return Ok(self.settle(Resolution::RetryExceeded));
        }

        let retry_attempts = message.retry_attempts.saturating_add(1);
        let delay = self
            .backoff
            .delay(retry_attempts, policy, adapter.max_delay());
        adapter.reschedule(delivery, retry_attempts, delay).await?;
        info!(
            message_id = %message.id,
            queue = %policy.name,
            retry_attempts,
            delay_secs = delay.as_secs(),
            "message scheduled for retry"
        );
        self.callbacks.retry(message);
        Ok(self.settle(Resolution::Retried {
            retry_attempts,
            delay,
        }))
    }

    fn settle(&self, resolution: Resolution) -> Resolution {
        self.lock_counts().record(&resolution);
        resolution
    }

    fn lock_counts(&self) -> MutexGuard<'_, PipelineCounts> {
        self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for MessagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePipeline")
            .field("queue", &self.queue.name)
            .field("nonce", &self.nonce)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandlerError, MessageId, NonceError};
    use crate::impls::{InMemoryBroker, InMemoryNonceStore};
    use crate::ports::{BrokerClient, FixedJitter, NonceStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Scripted handler: counts calls and behaves per `mode`.
    struct Scripted {
        mode: Mode,
        calls: AtomicU32,
    }

    #[derive(Clone, Copy)]
    enum Mode {
        Ok,
        Fail,
        Abort,
        Drop,
        FailAndDrop,
        Panic,
    }

    impl Scripted {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                mode,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageHandler for Scripted {
        async fn handle(&self, _content: &[u8], args: &mut MessageArgs) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                Mode::Ok => Ok(()),
                Mode::Fail => Err("handler failed".into()),
                Mode::Abort => {
                    args.abort = true;
                    Ok(())
                }
                Mode::Drop => {
                    args.drop = true;
                    Ok(())
                }
                Mode::FailAndDrop => {
                    args.drop = true;
                    Err("poison message".into())
                }
                Mode::Panic => panic!("handler bug"),
            }
        }
    }

    struct Harness {
        broker: InMemoryBroker,
        adapter: Box<dyn BrokerAdapter>,
        store: Arc<InMemoryNonceStore>,
        nonce: Arc<NonceManager>,
        retried: Arc<AtomicU32>,
        exceeded: Arc<AtomicU32>,
        errors: Arc<AtomicU32>,
    }

    impl Harness {
        async fn new() -> Self {
            let broker = InMemoryBroker::new();
            let adapter = broker.open(&QueuePolicy::default()).await.unwrap();
            let store = Arc::new(InMemoryNonceStore::new());
            let nonce = Arc::new(NonceManager::with_store(
                store.clone(),
                Duration::from_secs(60),
            ));
            Self {
                broker,
                adapter,
                store,
                nonce,
                retried: Arc::default(),
                exceeded: Arc::default(),
                errors: Arc::default(),
            }
        }

        fn pipeline(&self, queue: QueuePolicy, handler: Arc<dyn MessageHandler>) -> MessagePipeline {
            let (retried, exceeded, errors) = (
                Arc::clone(&self.retried),
                Arc::clone(&self.exceeded),
                Arc::clone(&self.errors),
            );
            let callbacks = Callbacks::new()
                .on_retry(move |_| {
                    retried.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .on_retry_exceeded(move |_| {
                    exceeded.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .on_error(move |_, _| {
                    errors.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            MessagePipeline::new(Arc::new(queue), handler, Arc::clone(&self.nonce))
                .with_callbacks(callbacks)
                .with_backoff(RetryBackoff::with_jitter(Arc::new(FixedJitter(0))))
        }

        async fn deliver(&mut self, message: Message) -> Delivery {
            self.broker.publish(message).await;
            self.adapter.fetch(Duration::ZERO).await.unwrap().unwrap()
        }
    }

    fn retrying(max_retry_attempts: u32) -> QueuePolicy {
        QueuePolicy {
            allow_retry: true,
            max_retry_attempts,
            ..QueuePolicy::named("orders")
        }
    }

    #[tokio::test]
    async fn success_acks_and_keeps_lock() {
        let mut h = Harness::new().await;
        let handler = Scripted::new(Mode::Ok);
        let pipeline = h.pipeline(retrying(3), handler.clone());

        let delivery = h.deliver(Message::new("t", b"".to_vec()).with_id("m-1")).await;
        let resolution = pipeline.process(h.adapter.as_mut(), delivery).await.unwrap();

        assert_eq!(resolution, Resolution::Accepted);
        assert_eq!(handler.calls(), 1);
        assert_eq!(h.broker.acked().await, vec![MessageId::new("m-1")]);
        assert!(h.store.contains("m-1"));
        assert_eq!(pipeline.counts().accepted, 1);
    }

    #[tokio::test]
    async fn duplicate_is_acked_without_handler() {
        let mut h = Harness::new().await;
        let handler = Scripted::new(Mode::Ok);
        let pipeline = h.pipeline(retrying(3), handler.clone());

        // someone else holds the lock
        h.nonce.lock(&MessageId::new("m-1")).await.unwrap();

        let delivery = h.deliver(Message::new("t", b"".to_vec()).with_id("m-1")).await;
        let resolution = pipeline.process(h.adapter.as_mut(), delivery).await.unwrap();

        assert_eq!(resolution, Resolution::Duplicate);
        assert_eq!(handler.calls(), 0);
        assert_eq!(h.broker.counts().await.acked, 1);
        assert_eq!(pipeline.counts().duplicates, 1);
    }

    #[tokio::test]
    async fn failure_reschedules_with_incremented_attempts() {
        let mut h = Harness::new().await;
        let pipeline = h.pipeline(retrying(3), Scripted::new(Mode::Fail));

        let delivery = h
            .deliver(Message::new("t", b"".to_vec()).with_id("m-1").with_retry_attempts(1))
            .await;
        let resolution = pipeline.process(h.adapter.as_mut(), delivery).await.unwrap();

        assert_eq!(
            resolution,
            Resolution::Retried {
                retry_attempts: 2,
                delay: Duration::from_secs(30),
            }
        );
        assert_eq!(h.broker.counts().await.scheduled, 1);
        assert_eq!(h.retried.load(Ordering::SeqCst), 1);
        assert_eq!(h.errors.load(Ordering::SeqCst), 1);
        // lock released so the retry can take it
        assert!(!h.store.contains("m-1"));
    }

    #[tokio::test]
    async fn abort_flag_counts_as_failure() {
        let mut h = Harness::new().await;
        let pipeline = h.pipeline(retrying(3), Scripted::new(Mode::Abort));

        let delivery = h.deliver(Message::new("t", b"".to_vec())).await;
        let resolution = pipeline.process(h.adapter.as_mut(), delivery).await.unwrap();
        assert!(matches!(resolution, Resolution::Retried { retry_attempts: 1, .. }));
    }

    #[tokio::test]
    async fn limit_reached_removes_and_fires_exceeded_once() {
        let mut h = Harness::new().await;
        let pipeline = h.pipeline(retrying(2), Scripted::new(Mode::Fail));

        let delivery = h
            .deliver(Message::new("t", b"".to_vec()).with_id("m-1").with_retry_attempts(2))
            .await;
        let resolution = pipeline.process(h.adapter.as_mut(), delivery).await.unwrap();

        assert_eq!(resolution, Resolution::RetryExceeded);
        assert_eq!(h.broker.removed().await, vec![MessageId::new("m-1")]);
        assert_eq!(h.exceeded.load(Ordering::SeqCst), 1);
        assert_eq!(h.retried.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_disabled_discards_without_exceeded_callback() {
        let mut h = Harness::new().await;
        let queue = QueuePolicy {
            allow_retry: false,
            ..retrying(5)
        };
        let pipeline = h.pipeline(queue, Scripted::new(Mode::Fail));

        let delivery = h.deliver(Message::new("t", b"".to_vec())).await;
        let resolution = pipeline.process(h.adapter.as_mut(), delivery).await.unwrap();

        assert_eq!(resolution, Resolution::Discarded);
        assert_eq!(h.broker.counts().await.removed, 1);
        assert_eq!(h.exceeded.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn drop_flag_removes_on_success_and_failure() {
        let mut h = Harness::new().await;

        let ok_drop = h.pipeline(retrying(3), Scripted::new(Mode::Drop));
        let delivery = h.deliver(Message::new("t", b"".to_vec()).with_id("a")).await;
        assert_eq!(
            ok_drop.process(h.adapter.as_mut(), delivery).await.unwrap(),
            Resolution::Dropped
        );
        assert!(h.store.contains("a"));

        let fail_drop = h.pipeline(retrying(3), Scripted::new(Mode::FailAndDrop));
        let delivery = h.deliver(Message::new("t", b"".to_vec()).with_id("b")).await;
        assert_eq!(
            fail_drop.process(h.adapter.as_mut(), delivery).await.unwrap(),
            Resolution::Dropped
        );
        assert!(!h.store.contains("b"));

        assert_eq!(h.broker.counts().await.removed, 2);
        assert_eq!(h.retried.load(Ordering::SeqCst), 0);
        assert_eq!(h.exceeded.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_panic_is_a_processing_failure() {
        let mut h = Harness::new().await;
        let pipeline = h.pipeline(retrying(3), Scripted::new(Mode::Panic));

        let delivery = h.deliver(Message::new("t", b"".to_vec())).await;
        let resolution = pipeline.process(h.adapter.as_mut(), delivery).await.unwrap();
        assert!(matches!(resolution, Resolution::Retried { .. }));
    }

    struct AcceptAll;

    impl SignatureVerifier for AcceptAll {
        fn verify(&self, _message: &Message, signature: &str) -> bool {
            signature == "valid"
        }
    }

    #[tokio::test]
    async fn missing_or_bad_signature_skips_handler() {
        let mut h = Harness::new().await;
        let handler = Scripted::new(Mode::Ok);
        let queue = QueuePolicy {
            require_signature: true,
            ..retrying(3)
        };
        let pipeline = h
            .pipeline(queue, handler.clone())
            .with_verifier(Some(Arc::new(AcceptAll)));

        for message in [
            Message::new("t", b"".to_vec()).with_id("unsigned"),
            Message::new("t", b"".to_vec()).with_id("forged").with_signature("forged"),
        ] {
            let delivery = h.deliver(message).await;
            let resolution = pipeline.process(h.adapter.as_mut(), delivery).await.unwrap();
            assert!(matches!(resolution, Resolution::Retried { .. }));
        }
        assert_eq!(handler.calls(), 0);

        let delivery = h
            .deliver(Message::new("t", b"".to_vec()).with_id("signed").with_signature("valid"))
            .await;
        let resolution = pipeline.process(h.adapter.as_mut(), delivery).await.unwrap();
        assert_eq!(resolution, Resolution::Accepted);
        assert_eq!(handler.calls(), 1);
    }

    struct DownStore;

    #[async_trait]
    impl NonceStore for DownStore {
        async fn set_nx_ex(&self, _key: &str, _ttl: Duration) -> Result<bool, NonceError> {
            Err(NonceError::PoolTimeout(Duration::from_millis(5)))
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), NonceError> {
            Err(NonceError::PoolClosed)
        }

        async fn del(&self, _key: &str) -> Result<(), NonceError> {
            Err(NonceError::PoolClosed)
        }
    }

    #[tokio::test]
    async fn dedup_store_failure_takes_reject_path() {
        let mut h = Harness::new().await;
        h.nonce.configure(Arc::new(DownStore), Duration::from_secs(60));
        let handler = Scripted::new(Mode::Ok);
        let pipeline = h.pipeline(retrying(3), handler.clone());

        let delivery = h.deliver(Message::new("t", b"".to_vec())).await;
        let resolution = pipeline.process(h.adapter.as_mut(), delivery).await.unwrap();

        assert!(matches!(resolution, Resolution::Retried { .. }));
        assert_eq!(handler.calls(), 0);
        assert_eq!(h.errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_callback_does_not_break_the_pipeline() {
        let mut h = Harness::new().await;
        let pipeline = MessagePipeline::new(
            Arc::new(retrying(3)),
            Scripted::new(Mode::Fail),
            Arc::clone(&h.nonce),
        )
        .with_callbacks(
            Callbacks::new()
                .on_retry(|_| panic!("callback bug"))
                .on_error(|_, _| Err("also broken".into())),
        );

        let delivery = h.deliver(Message::new("t", b"".to_vec())).await;
        let resolution = pipeline.process(h.adapter.as_mut(), delivery).await.unwrap();
        assert!(matches!(resolution, Resolution::Retried { .. }));
    }

    #[tokio::test]
    async fn broker_failure_escapes() {
        let mut h = Harness::new().await;
        let pipeline = h.pipeline(retrying(3), Scripted::new(Mode::Ok));

        let delivery = h.deliver(Message::new("t", b"".to_vec())).await;
        // settle it behind the pipeline's back so the ack has no receipt
        h.adapter.remove(&delivery).await.unwrap();

        let err = pipeline
            .process(h.adapter.as_mut(), delivery)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Ack(_)));
    }
}
