use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use shuttle_core::app::{Callbacks, MessageHandler, WorkerOptions, WorkerSupervisor};
use shuttle_core::domain::{HandlerError, Message, MessageArgs, QueuePolicy};
use shuttle_core::impls::InMemoryBroker;
use shuttle_core::nonce::NonceManager;
use shuttle_core::settings::{LogFormat, LogSettings, Settings};

#[derive(Debug, Deserialize)]
struct HelloPayload {
    name: String,
}

/// Fails the first `n` calls, then greets.
struct HelloHandler {
    remaining_failures: AtomicU32,
}

impl HelloHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl MessageHandler for HelloHandler {
    async fn handle(&self, content: &[u8], args: &mut MessageArgs) -> Result<(), HandlerError> {
        let p: HelloPayload = serde_json::from_slice(content)?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(format!("intentional failure (left={left})").into());
        }

        info!(message_id = %args.id, attempt = args.retry_attempts, "Hello, {}!", p.name);
        Ok(())
    }
}

fn init_logging(log: &LogSettings) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("failed to install json logger")?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("failed to install pretty logger")?,
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // (A) 設定とログ
    let settings = Settings::load().context("failed to load settings")?;
    init_logging(&settings.log)?;

    // (B) dedup ロック（SHUTTLE__NONCE__URL があれば redis、なければ無効）
    let nonce = Arc::new(NonceManager::new());
    match &settings.nonce {
        Some(config) => {
            nonce
                .configure_redis(config)
                .context("failed to configure nonce store")?;
            info!(url = %config.url, lifespan_secs = config.lifespan_secs, "deduplication enabled");
        }
        None => info!("deduplication disabled"),
    }

    if let Some(endpoint) = &settings.broker.endpoint {
        warn!(%endpoint, "demo runs against the in-memory broker, endpoint ignored");
    }

    // (C) キューとメッセージ投入
    let broker = InMemoryBroker::new();
    for name in ["shuttle", "relay", "loom"] {
        let message = Message::json("hello", &serde_json::json!({ "name": name }));
        info!(message_id = %message.id, "published");
        broker.publish(message).await;
    }

    let queue = QueuePolicy {
        max_retry_attempts: 3,
        retry_delay_ms: 1_000,
        allow_retry_back_off: true,
        ..QueuePolicy::named("hello")
    };

    let callbacks = Callbacks::new()
        .on_retry(|message| {
            info!(message_id = %message.id, "retry scheduled");
            Ok(())
        })
        .on_retry_exceeded(|message| {
            warn!(message_id = %message.id, "gave up on message");
            Ok(())
        });

    let options = WorkerOptions::from_settings(&settings.worker)
        .client(Arc::new(broker.clone()))
        .callbacks(callbacks);
    let block = options.block_process;

    // (D) ワーカー起動
    let supervisor = WorkerSupervisor::new(Arc::clone(&nonce));
    supervisor
        .start(queue, options, Arc::new(HelloHandler::new(2)))
        .await
        .context("failed to start workers")?;

    // (E) 非ブロッキングなら、キューが空になる（かシグナルで止まる）まで待つ
    if !block {
        while supervisor.is_running() && !broker.counts().await.is_drained() {
            sleep(Duration::from_millis(50)).await;
        }
        supervisor.stop().await;
    }

    info!(counts = ?supervisor.counts(), broker = ?broker.counts().await, "finished");
    nonce.reset();
    Ok(())
}
