//! Errors - エラー型と分類
//!
//! - `ShuttleError`: supervisor レベル（start/stop の失敗）
//! - `ProcessingError`: メッセージ単位の失敗。すべて reject 経路に流れる
//! - `NonceError`: dedup ストア（プール枯渇・接続断）
//! - `BrokerError`: ブローカーアダプタの失敗
//! - `WorkerThreadError`: poll ループから漏れた失敗。そのワーカーを止める（fail-fast）

use std::time::Duration;

use thiserror::Error;

use super::ids::MessageId;
use super::state::SupervisorState;

/// Error type handlers return. Boxed so handler code can use `?` on anything.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Supervisor-level errors. Fatal for the `start`/`stop` call that raised them.
#[derive(Debug, Error)]
pub enum ShuttleError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("worker supervisor already started")]
    AlreadyRunning,

    #[error("illegal supervisor transition {from} -> {to}")]
    InvalidTransition {
        from: SupervisorState,
        to: SupervisorState,
    },

    #[error(transparent)]
    WorkerThread(#[from] WorkerThreadError),
}

/// Per-message failure. Never escapes the pipeline: every variant is turned
/// into the reject/retry protocol.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("invalid or missing signature on message {0}")]
    InvalidSignature(MessageId),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("handler panicked")]
    HandlerPanicked,

    #[error("handler requested abort")]
    Aborted,

    #[error(transparent)]
    Nonce(#[from] NonceError),
}

/// Dedup store failures (DeduplicationStoreError).
#[derive(Debug, Clone, Error)]
pub enum NonceError {
    #[error("timed out after {0:?} waiting for a nonce store connection")]
    PoolTimeout(Duration),

    #[error("nonce store pool is closed")]
    PoolClosed,

    #[error("failed to connect to nonce store: {0}")]
    Connect(String),

    #[error("nonce store command failed: {0}")]
    Store(String),
}

/// Broker adapter failures.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("ack failed: {0}")]
    Ack(String),

    #[error("reschedule failed: {0}")]
    Reschedule(String),

    #[error("remove failed: {0}")]
    Remove(String),
}

/// Why a poll loop died.
#[derive(Debug, Clone, Error)]
pub enum WorkerFailure {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("could not start: {0}")]
    Startup(String),
}

/// Failure that escaped a poll-loop iteration. Terminates the owning worker
/// so an outer supervisor/orchestrator can restart it.
#[derive(Debug, Clone, Error)]
#[error("worker {worker} terminated: {cause}")]
pub struct WorkerThreadError {
    pub worker: String,
    #[source]
    pub cause: WorkerFailure,
}

impl WorkerThreadError {
    pub fn new(worker: impl Into<String>, cause: impl Into<WorkerFailure>) -> Self {
        Self {
            worker: worker.into(),
            cause: cause.into(),
        }
    }
}
