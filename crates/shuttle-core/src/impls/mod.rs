//! Impls - 開発用・テスト用の実装
//!
//! - **InMemoryBroker**: 遅延再配送つきのインメモリブローカー
//! - **InMemoryNonceStore**: 期限つきのインメモリ KV（dedup 用）
//!
//! 本番用のブローカーアダプタは `BrokerClient` を実装した別クレートに置きます。
//! dedup ストアの本番実装は `nonce::RedisNonceStore`。

pub mod inmem_broker;
pub mod inmem_nonce;

pub use self::inmem_broker::{BrokerCounts, InMemoryBroker};
pub use self::inmem_nonce::InMemoryNonceStore;
