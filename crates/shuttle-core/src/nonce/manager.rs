//! NonceManager - メッセージ ID 単位の分散排他ロック
//!
//! 未設定（disabled）のときはすべての操作が no-op で成功します。
//! その場合の重複排除はブローカー自身の配送保証に任せます。
//!
//! # ロックの寿命
//! - `lock`: SET NX EX lifespan。取れたら排他を保持
//! - `complete`: 成功後も lifespan だけ残す（直後の重複再配送を弾くため）
//! - `failed`: 即削除（リトライがすぐロックを取り直せるように）

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::debug;

use super::config::NonceConfig;
use super::redis_store::RedisNonceStore;
use crate::domain::{MessageId, NonceError};
use crate::ports::NonceStore;

#[derive(Clone)]
struct ActiveNonce {
    store: Arc<dyn NonceStore>,
    lifespan: Duration,
}

/// DeduplicationLock.
///
/// Constructed once and shared (`Arc<NonceManager>`) by the supervisor and
/// every pipeline; there is no process-global lock state.
#[derive(Default)]
pub struct NonceManager {
    active: RwLock<Option<ActiveNonce>>,
}

impl NonceManager {
    /// Disabled manager: every message is treated as first-seen.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: Arc<dyn NonceStore>, lifespan: Duration) -> Self {
        let manager = Self::new();
        manager.configure(store, lifespan);
        manager
    }

    /// Enable deduplication against `store`. Replaces (and closes) any
    /// previously configured store.
    pub fn configure(&self, store: Arc<dyn NonceStore>, lifespan: Duration) {
        let previous = self
            .write()
            .replace(ActiveNonce { store, lifespan });
        if let Some(previous) = previous {
            previous.store.close();
        }
    }

    /// Enable deduplication against a redis endpoint with a bounded pool.
    pub fn configure_redis(&self, config: &NonceConfig) -> Result<(), NonceError> {
        let store = RedisNonceStore::new(config)?;
        self.configure(Arc::new(store), config.lifespan());
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.read().is_some()
    }

    /// Try to take exclusivity on `id`. Always `true` when disabled.
    pub async fn lock(&self, id: &MessageId) -> Result<bool, NonceError> {
        let Some(active) = self.snapshot() else {
            return Ok(true);
        };
        let acquired = active.store.set_nx_ex(id.as_str(), active.lifespan).await?;
        debug!(message_id = %id, acquired, "nonce lock");
        Ok(acquired)
    }

    /// Keep the key around for another lifespan after a successful handling.
    pub async fn complete(&self, id: &MessageId) -> Result<(), NonceError> {
        let Some(active) = self.snapshot() else {
            return Ok(());
        };
        active.store.expire(id.as_str(), active.lifespan).await
    }

    /// Drop the key right away so a retry can re-acquire it.
    pub async fn failed(&self, id: &MessageId) -> Result<(), NonceError> {
        let Some(active) = self.snapshot() else {
            return Ok(());
        };
        active.store.del(id.as_str()).await
    }

    /// Tear down configuration and the store's pool. Test isolation only.
    pub fn reset(&self) {
        if let Some(active) = self.write().take() {
            active.store.close();
        }
    }

    // Clone out of the lock so no guard is held across an await.
    fn snapshot(&self) -> Option<ActiveNonce> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<ActiveNonce>> {
        self.active.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<ActiveNonce>> {
        self.active.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for NonceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceManager")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
