//! RedisNonceStore - 本番用の dedup ストア
//!
//! `SET key 1 NX EX ttl` / `EXPIRE key ttl` / `DEL key` をプール経由で発行します。
//! コマンド失敗時の接続はプールに戻さず破棄します。

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, FromRedisValue};
use tracing::warn;

use super::config::NonceConfig;
use super::pool::{ConnectionPool, ManageConnection};
use crate::domain::NonceError;
use crate::ports::NonceStore;

/// Opens multiplexed connections for the pool.
pub struct RedisConnector {
    client: Client,
    connect_timeout: Duration,
}

#[async_trait]
impl ManageConnection for RedisConnector {
    type Connection = MultiplexedConnection;

    async fn connect(&self) -> Result<MultiplexedConnection, NonceError> {
        match tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(NonceError::Connect(e.to_string())),
            Err(_) => Err(NonceError::Connect(format!(
                "timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }
}

pub struct RedisNonceStore {
    pool: ConnectionPool<RedisConnector>,
    command_timeout: Duration,
}

impl RedisNonceStore {
    /// Build the store and its pool. No connection is opened until first use.
    pub fn new(config: &NonceConfig) -> Result<Self, NonceError> {
        let client =
            Client::open(config.url.as_str()).map_err(|e| NonceError::Connect(e.to_string()))?;
        let connector = RedisConnector {
            client,
            connect_timeout: config.timeout(),
        };
        Ok(Self {
            pool: ConnectionPool::new(connector, config.pool_size, config.pool_timeout()),
            command_timeout: config.timeout(),
        })
    }

    async fn run<T: FromRedisValue>(&self, cmd: Cmd) -> Result<T, NonceError> {
        let mut conn = self.pool.get().await?;
        let result = tokio::time::timeout(self.command_timeout, cmd.query_async::<T>(&mut *conn)).await;
        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                conn.discard();
                Err(NonceError::Store(e.to_string()))
            }
            Err(_) => {
                warn!(timeout = ?self.command_timeout, "nonce store command timed out");
                conn.discard();
                Err(NonceError::Store(format!(
                    "timed out after {:?}",
                    self.command_timeout
                )))
            }
        }
    }
}

/// `EX 0` is rejected by redis; never ask for less than a second.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl NonceStore for RedisNonceStore {
    async fn set_nx_ex(&self, key: &str, ttl: Duration) -> Result<bool, NonceError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(1).arg("NX").arg("EX").arg(ttl_secs(ttl));
        let reply: Option<String> = self.run(cmd).await?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), NonceError> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl_secs(ttl));
        let _: i64 = self.run(cmd).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), NonceError> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let _: i64 = self.run(cmd).await?;
        Ok(())
    }

    fn close(&self) {
        self.pool.close();
    }
}
