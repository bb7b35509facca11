//! Handler - 利用者のメッセージ処理とコールバック
//!
//! # 学習ポイント
//! - Object-safe な async trait（`Arc<dyn MessageHandler>` で保持）
//! - コールバックは `Option<Arc<dyn Fn ..>>` の集合
//! - コールバックは必ずエラー境界（`catch_unwind`）越しに呼ぶ。失敗はログだけ

use std::error::Error;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::domain::{HandlerError, Message, MessageArgs};

/// Caller-supplied message handling.
///
/// Returning `Err` (or setting `args.abort`) rejects the delivery; setting
/// `args.drop` removes it for good.
///
/// # 使用例
/// ```ignore
/// struct Greeter;
///
/// #[async_trait]
/// impl MessageHandler for Greeter {
///     async fn handle(&self, content: &[u8], args: &mut MessageArgs) -> Result<(), HandlerError> {
///         let payload: serde_json::Value = serde_json::from_slice(content)?;
///         println!("{} -> {payload}", args.id);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, content: &[u8], args: &mut MessageArgs) -> Result<(), HandlerError>;
}

pub type CallbackResult = Result<(), HandlerError>;

pub type ErrorCallback =
    Arc<dyn Fn(&(dyn Error + 'static), Option<&Message>) -> CallbackResult + Send + Sync>;

pub type MessageCallback = Arc<dyn Fn(&Message) -> CallbackResult + Send + Sync>;

/// Optional hooks: `on_error`, `on_retry`, `on_retry_exceeded`.
///
/// Each fires at most once per triggering event. Errors and panics raised
/// inside a callback are logged at warn and swallowed.
#[derive(Clone, Default)]
pub struct Callbacks {
    on_error: Option<ErrorCallback>,
    on_retry: Option<MessageCallback>,
    on_retry_exceeded: Option<MessageCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch failures (`message = None`) and rejected deliveries.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&(dyn Error + 'static), Option<&Message>) -> CallbackResult + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// A rejected message was handed back for redelivery.
    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&Message) -> CallbackResult + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(f));
        self
    }

    /// A rejected message used up its retries and was removed.
    pub fn on_retry_exceeded<F>(mut self, f: F) -> Self
    where
        F: Fn(&Message) -> CallbackResult + Send + Sync + 'static,
    {
        self.on_retry_exceeded = Some(Arc::new(f));
        self
    }

    pub(crate) fn error(&self, err: &(dyn Error + 'static), message: Option<&Message>) {
        if let Some(cb) = &self.on_error {
            guarded("on_error", || cb(err, message));
        }
    }

    pub(crate) fn retry(&self, message: &Message) {
        if let Some(cb) = &self.on_retry {
            guarded("on_retry", || cb(message));
        }
    }

    pub(crate) fn retry_exceeded(&self, message: &Message) {
        if let Some(cb) = &self.on_retry_exceeded {
            guarded("on_retry_exceeded", || cb(message));
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_error", &self.on_error.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field("on_retry_exceeded", &self.on_retry_exceeded.is_some())
            .finish()
    }
}

fn guarded(name: &'static str, f: impl FnOnce() -> CallbackResult) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(callback = name, error = %err, "callback failed"),
        Err(_) => warn!(callback = name, "callback panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn unset_callbacks_are_no_ops() {
        let callbacks = Callbacks::new();
        let message = Message::new("t", b"".to_vec());
        callbacks.retry(&message);
        callbacks.retry_exceeded(&message);
        callbacks.error(&std::fmt::Error, None);
    }

    #[test]
    fn failing_and_panicking_callbacks_are_swallowed() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let callbacks = Callbacks::new()
            .on_retry(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Err("boom".into())
            })
            .on_retry_exceeded(|_| panic!("callback bug"));

        let message = Message::new("t", b"".to_vec());
        callbacks.retry(&message);
        callbacks.retry_exceeded(&message);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_error_sees_the_message() {
        let ids = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&ids);
        let callbacks = Callbacks::new().on_error(move |err, message| {
            sink.lock()
                .unwrap()
                .push((err.to_string(), message.map(|m| m.id.to_string())));
            Ok(())
        });

        let message = Message::new("t", b"".to_vec()).with_id("m-1");
        callbacks.error(&std::fmt::Error, Some(&message));
        callbacks.error(&std::fmt::Error, None);

        let ids = ids.lock().unwrap();
        assert_eq!(ids[0].1.as_deref(), Some("m-1"));
        assert_eq!(ids[1].1, None);
    }
}
