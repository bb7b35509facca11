//! shuttle-core
//!
//! Broker-agnostic message consumption: a pool of poll loops pulls messages,
//! deduplicates them, runs the caller's handler and drives retry/backoff.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, message, policy, state, errors）
//! - **ports**: 外部コラボレータの trait（BrokerClient/BrokerAdapter, NonceStore, SignatureVerifier, JitterSource）
//! - **retry**: RetryBackoff（遅延計算）
//! - **nonce**: NonceManager（dedup ロック）+ 接続プール + redis 実装
//! - **app**: WorkerSupervisor, MessagePipeline, PollLoop, WorkerStatusRegistry
//! - **impls**: InMemoryBroker / InMemoryNonceStore（開発・テスト用）
//! - **settings**: 設定の読み込み（config crate）
//! - **observability**: PipelineCounts

pub mod app;
pub mod domain;
pub mod impls;
pub mod nonce;
pub mod observability;
pub mod ports;
pub mod retry;
pub mod settings;
