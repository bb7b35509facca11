//! NonceStore port - dedup ロック用の共有 KV ストア
//!
//! 必要なのは 3 コマンドだけ:
//! - `SET key value NX EX ttl`
//! - `EXPIRE key ttl`
//! - `DEL key`
//!
//! # 実装
//! - **RedisNonceStore**: 本番用（`nonce::redis`）
//! - **InMemoryNonceStore**: 開発・テスト用（`impls::inmem_nonce`）

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::NonceError;

#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Atomic set-if-absent with expiry. `true` iff the key was set.
    async fn set_nx_ex(&self, key: &str, ttl: Duration) -> Result<bool, NonceError>;

    /// Reset the key's expiry. Missing keys are not an error.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), NonceError>;

    /// Delete the key. Missing keys are not an error.
    async fn del(&self, key: &str) -> Result<(), NonceError>;

    /// Release pooled resources. Later calls fail with `NonceError::PoolClosed`.
    fn close(&self) {}
}
