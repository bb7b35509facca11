//! InMemoryNonceStore - 開発・テスト用の dedup ストア
//!
//! プロセス内でしか排他できないので本番では RedisNonceStore を使うこと。
//! 期限は `tokio::time::Instant` で管理（`start_paused` のテストで時間を進められる）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::NonceError;
use crate::ports::NonceStore;

/// Expired keys are swept once the map grows past this many entries.
const PRUNE_THRESHOLD: usize = 1_024;

#[derive(Debug)]
struct Keys {
    expires: HashMap<String, Instant>,
    prune_at: usize,
}

impl Default for Keys {
    fn default() -> Self {
        Self {
            expires: HashMap::new(),
            prune_at: PRUNE_THRESHOLD,
        }
    }
}

impl Keys {
    // 生きているキーが多ければ次の掃除までの間隔を広げる
    fn prune(&mut self, now: Instant) {
        if self.expires.len() < self.prune_at {
            return;
        }
        self.expires.retain(|_, expires_at| *expires_at > now);
        self.prune_at = (self.expires.len() * 2).max(PRUNE_THRESHOLD);
    }
}

#[derive(Default)]
pub struct InMemoryNonceStore {
    keys: Mutex<Keys>,
    closed: AtomicBool,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Is `key` currently held (and not expired)?
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock_keys()
            .expires
            .get(key)
            .is_some_and(|expires_at| *expires_at > now)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), NonceError> {
        if self.is_closed() {
            Err(NonceError::PoolClosed)
        } else {
            Ok(())
        }
    }

    fn lock_keys(&self) -> MutexGuard<'_, Keys> {
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn set_nx_ex(&self, key: &str, ttl: Duration) -> Result<bool, NonceError> {
        self.check_open()?;
        let now = Instant::now();
        let mut keys = self.lock_keys();
        match keys.expires.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                keys.prune(now);
                keys.expires.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), NonceError> {
        self.check_open()?;
        let now = Instant::now();
        let mut keys = self.lock_keys();
        if let Some(expires_at) = keys.expires.get_mut(key)
            && *expires_at > now
        {
            *expires_at = now + ttl;
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), NonceError> {
        self.check_open()?;
        self.lock_keys().expires.remove(key);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.lock_keys().expires.clear();
    }
}
