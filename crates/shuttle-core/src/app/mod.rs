//! App - アプリケーション層
//!
//! ports を組み合わせてワーカーを動かします。
//!
//! # 主要コンポーネント
//! - **WorkerSupervisor**: start / stop と fan-out、シグナル
//! - **MessagePipeline**: 1 配送ぶんの状態機械（dedup → handler → accept/reject）
//! - **PollLoop**: fetch → pipeline → loop
//! - **WorkerStatusRegistry**: 起動したワーカーの台帳
//! - **MessageHandler / Callbacks**: 利用者が差し込むもの

pub mod handler;
pub mod options;
pub mod pipeline;
pub mod status;
pub mod supervisor;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::handler::{CallbackResult, Callbacks, MessageHandler};
pub use self::options::WorkerOptions;
pub use self::pipeline::MessagePipeline;
pub use self::status::{StatusReporter, WorkerProcess, WorkerStatusRegistry, WorkerThread};
pub use self::supervisor::WorkerSupervisor;
pub use self::worker_loop::PollLoop;
