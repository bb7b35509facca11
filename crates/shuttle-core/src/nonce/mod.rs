//! Nonce - DeduplicationLock
//!
//! - **NonceManager**: lock / complete / failed / reset
//! - **ConnectionPool**: 上限付きプール（スコープ付きチェックアウト）
//! - **RedisNonceStore**: redis 実装

pub mod config;
pub mod manager;
pub mod pool;
pub mod redis_store;

pub use self::config::NonceConfig;
pub use self::manager::NonceManager;
pub use self::pool::{ConnectionPool, ManageConnection, PooledConnection};
pub use self::redis_store::RedisNonceStore;
