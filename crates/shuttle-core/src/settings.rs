//! Settings - 設定の読み込み
//!
//! 優先順位（下ほど強い）:
//! 1. コード内のデフォルト
//! 2. 追加ソース（`load_with`、テストやファイル）
//! 3. 環境変数 `SHUTTLE__<SECTION>__<KEY>`（例: `SHUTTLE__WORKER__THREAD_COUNT=4`）
//!
//! グローバルな状態は持たない。読み込んだ `Settings` を明示的に渡すこと。

use config::{Config, ConfigError, Environment, Source};
use serde::{Deserialize, Serialize};

use crate::domain::ShuttleError;
use crate::nonce::NonceConfig;

pub const ENV_PREFIX: &str = "SHUTTLE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub worker: WorkerSettings,

    /// Dedup store. Absent means deduplication is disabled.
    pub nonce: Option<NonceConfig>,

    pub broker: BrokerSettings,

    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub thread_count: usize,
    /// 0 = run every poll loop on the caller's runtime.
    pub fork_count: usize,
    pub wait: bool,
    pub block_process: bool,
    pub queue_poll_wait_secs: u64,
    pub empty_poll_sleep_ms: u64,
    /// Messages between `reclaim` hints (0 = never).
    pub gc_flush_interval: u64,
    pub trap_signals: bool,
    /// Exit the process once a trapped signal has stopped the workers.
    pub exit_on_signal: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            thread_count: 1,
            fork_count: 0,
            wait: true,
            block_process: false,
            queue_poll_wait_secs: 20,
            empty_poll_sleep_ms: 0,
            gc_flush_interval: 0,
            trap_signals: true,
            exit_on_signal: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Endpoint override handed to the broker client.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Settings {
    /// Defaults overridden by `SHUTTLE__*` environment variables.
    pub fn load() -> Result<Self, ShuttleError> {
        Self::build(None::<Config>)
    }

    /// Like `load`, with an extra source between the defaults and the
    /// environment.
    pub fn load_with<S>(source: S) -> Result<Self, ShuttleError>
    where
        S: Source + Send + Sync + 'static,
    {
        Self::build(Some(source))
    }

    fn build<S>(extra: Option<S>) -> Result<Self, ShuttleError>
    where
        S: Source + Send + Sync + 'static,
    {
        let defaults = WorkerSettings::default();
        let mut builder = Config::builder()
            .set_default("worker.thread_count", defaults.thread_count as u64)
            .and_then(|b| b.set_default("worker.fork_count", defaults.fork_count as u64))
            .and_then(|b| b.set_default("worker.wait", defaults.wait))
            .and_then(|b| b.set_default("worker.block_process", defaults.block_process))
            .and_then(|b| {
                b.set_default("worker.queue_poll_wait_secs", defaults.queue_poll_wait_secs)
            })
            .and_then(|b| b.set_default("worker.empty_poll_sleep_ms", defaults.empty_poll_sleep_ms))
            .and_then(|b| b.set_default("worker.gc_flush_interval", defaults.gc_flush_interval))
            .and_then(|b| b.set_default("worker.trap_signals", defaults.trap_signals))
            .and_then(|b| b.set_default("worker.exit_on_signal", defaults.exit_on_signal))
            .and_then(|b| b.set_default("log.level", "info"))
            .and_then(|b| b.set_default("log.format", "pretty"))
            .map_err(config_error)?;

        if let Some(source) = extra {
            builder = builder.add_source(source);
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ShuttleError> {
        if self.worker.thread_count == 0 {
            return Err(ShuttleError::Configuration(
                "worker.thread_count must be at least 1".to_string(),
            ));
        }
        if let Some(nonce) = &self.nonce {
            if nonce.pool_size == 0 {
                return Err(ShuttleError::Configuration(
                    "nonce.pool_size must be at least 1".to_string(),
                ));
            }
            if nonce.lifespan_secs == 0 {
                return Err(ShuttleError::Configuration(
                    "nonce.lifespan_secs must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn config_error(err: ConfigError) -> ShuttleError {
    ShuttleError::Configuration(err.to_string())
}
