//! Bounded connection pool with scoped checkout.
//!
//! # 設計
//! - `Semaphore` のパーミット数 = プールサイズ（同時チェックアウト数の上限）
//! - アイドル接続は `Mutex<Vec<_>>` に戻す（await を跨いでロックしない）
//! - チェックアウトは `checkout_timeout` で打ち切り、枯渇はハングではなく
//!   `NonceError::PoolTimeout` になる
//! - `PooledConnection` の Drop で必ず返却される（エラー経路を含む）

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::domain::NonceError;

/// Creates connections for a `ConnectionPool`.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection, NonceError>;
}

pub struct ConnectionPool<M: ManageConnection> {
    manager: M,
    idle: Mutex<Vec<M::Connection>>,
    permits: Semaphore,
    checkout_timeout: Duration,
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Connections are opened lazily, at most `size` of them.
    pub fn new(manager: M, size: usize, checkout_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            manager,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Semaphore::new(size),
            checkout_timeout,
        }
    }

    /// Check out a connection, waiting at most `checkout_timeout` for a free slot.
    pub async fn get(&self) -> Result<PooledConnection<'_, M>, NonceError> {
        let permit = match tokio::time::timeout(self.checkout_timeout, self.permits.acquire()).await
        {
            Err(_) => return Err(NonceError::PoolTimeout(self.checkout_timeout)),
            Ok(Err(_)) => return Err(NonceError::PoolClosed),
            Ok(Ok(permit)) => permit,
        };

        let reused = self.lock_idle().pop();
        let conn = match reused {
            Some(conn) => conn,
            // permit is dropped on error, freeing the slot
            None => self.manager.connect().await?,
        };

        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            _permit: permit,
        })
    }

    /// Refuse further checkouts and drop idle connections. Connections still
    /// checked out are dropped when their guards go away.
    pub fn close(&self) {
        self.permits.close();
        self.lock_idle().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn idle_count(&self) -> usize {
        self.lock_idle().len()
    }

    fn lock_idle(&self) -> MutexGuard<'_, Vec<M::Connection>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Checked-out connection. Goes back to the pool on drop unless discarded.
pub struct PooledConnection<'a, M: ManageConnection> {
    pool: &'a ConnectionPool<M>,
    conn: Option<M::Connection>,
    _permit: SemaphorePermit<'a>,
}

impl<M: ManageConnection> PooledConnection<'_, M> {
    /// Throw the connection away instead of returning it (e.g. after an I/O error).
    pub fn discard(mut self) {
        self.conn.take();
    }
}

impl<M: ManageConnection> Deref for PooledConnection<'_, M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<'_, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl<M: ManageConnection> Drop for PooledConnection<'_, M> {
    fn drop(&mut self) {
        // 返却はパーミット解放より先（次の待ち手がアイドル接続を拾えるように）
        if let Some(conn) = self.conn.take()
            && !self.pool.is_closed()
        {
            self.pool.lock_idle().push(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        opened: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ManageConnection for Counter {
        type Connection = usize;

        async fn connect(&self) -> Result<usize, NonceError> {
            if self.fail {
                return Err(NonceError::Connect("refused".into()));
            }
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn pool(size: usize, fail: bool) -> ConnectionPool<Counter> {
        ConnectionPool::new(
            Counter {
                opened: AtomicUsize::new(0),
                fail,
            },
            size,
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn connections_are_reused() {
        let pool = pool(2, false);
        {
            let conn = pool.get().await.unwrap();
            assert_eq!(*conn, 0);
        }
        assert_eq!(pool.idle_count(), 1);

        let conn = pool.get().await.unwrap();
        assert_eq!(*conn, 0);
        assert_eq!(pool.manager.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_times_out() {
        let pool = pool(1, false);
        let _held = pool.get().await.unwrap();

        let err = pool.get().await.err().expect("second checkout must fail");
        assert!(matches!(err, NonceError::PoolTimeout(_)));
    }

    #[tokio::test]
    async fn release_unblocks_waiter() {
        let pool = std::sync::Arc::new(ConnectionPool::new(
            Counter {
                opened: AtomicUsize::new(0),
                fail: false,
            },
            1,
            Duration::from_secs(2),
        ));
        let held = pool.get().await.unwrap();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get().await.map(|c| *c) }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn discarded_connection_is_not_returned() {
        let pool = pool(1, false);
        pool.get().await.unwrap().discard();
        assert_eq!(pool.idle_count(), 0);

        // slot is free again and a fresh connection is opened
        let conn = pool.get().await.unwrap();
        assert_eq!(*conn, 1);
    }

    #[tokio::test]
    async fn connect_failure_frees_the_slot() {
        let pool = pool(1, true);
        assert!(matches!(pool.get().await, Err(NonceError::Connect(_))));
        assert!(matches!(pool.get().await, Err(NonceError::Connect(_))));
    }

    #[tokio::test]
    async fn closed_pool_refuses_checkout() {
        let pool = pool(1, false);
        pool.close();
        assert!(matches!(pool.get().await, Err(NonceError::PoolClosed)));
    }
}
