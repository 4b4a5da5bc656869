//! Wall-clock timeouts for individual operations.

use std::time::Duration;

use futures_core::future::BoxFuture;
use serde_json::Value;

use crate::connection::{Connection, ConnectionId, PreparedStatement};
use crate::error::{Error, Result};
use crate::pool::{Pool, PoolConnection};
use crate::result_set::RowSet;
use crate::stream::QueryStream;

/// A connection whose `execute` and `prepare` race a wall-clock alarm.
///
/// The alarm is dropped as soon as the operation completes on either path,
/// so a query finishing inside the grace window never observes a stale
/// timer firing. Streaming bypasses the timeout: there is no reliable way
/// to interrupt a stream mid-flight, so cancellation is the stream's own
/// concern. On backends that cannot interrupt a running query the timeout
/// is detection-only; the engine may keep computing after we give up.
pub struct TimeoutConnection<C: Connection> {
    inner: C,
    timeout: Duration,
}

impl<C: Connection> TimeoutConnection<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        TimeoutConnection { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Unwrap back to the underlying connection.
    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: Connection> Connection for TimeoutConnection<C> {
    fn id(&self) -> &ConnectionId {
        self.inner.id()
    }

    fn execute<'c>(&'c mut self, sql: &'c str, params: &'c [Value]) -> BoxFuture<'c, Result<RowSet>> {
        let timeout = self.timeout;
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.inner.execute(sql, params)).await {
                Ok(result) => result,
                Err(_) => Err(Error::QueryTimedOut { timeout }),
            }
        })
    }

    fn stream<'c>(&'c mut self, sql: &'c str, params: &'c [Value]) -> BoxFuture<'c, Result<QueryStream>> {
        self.inner.stream(sql, params)
    }

    fn prepare<'c>(&'c mut self, sql: &'c str) -> BoxFuture<'c, Result<PreparedStatement>> {
        let timeout = self.timeout;
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.inner.prepare(sql)).await {
                Ok(result) => result,
                Err(_) => Err(Error::QueryTimedOut { timeout }),
            }
        })
    }

    fn ping(&mut self) -> BoxFuture<'_, Result<()>> {
        let timeout = self.timeout;
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.inner.ping()).await {
                Ok(result) => result,
                Err(_) => Err(Error::QueryTimedOut { timeout }),
            }
        })
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn close(self) -> BoxFuture<'static, Result<()>> {
        self.inner.close()
    }
}

/// A pool whose checked-out connections are timeout-wrapped.
///
/// Releasing hands the *original* connection back to the pool — the wrapper
/// is peeled off by ownership, never returned in its place.
pub struct TimeoutPool<C: Connection> {
    pool: Pool<C>,
    timeout: Duration,
}

impl<C: Connection> TimeoutPool<C> {
    pub fn new(pool: Pool<C>, timeout: Duration) -> Self {
        TimeoutPool { pool, timeout }
    }

    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    pub async fn acquire(&self) -> Result<TimeoutConnection<PoolConnection<C>>> {
        let conn = self.pool.acquire().await?;
        Ok(TimeoutConnection::new(conn, self.timeout))
    }

    /// Return a wrapped connection to the underlying pool.
    pub async fn release(conn: TimeoutConnection<PoolConnection<C>>) {
        conn.into_inner().release().await;
    }

    /// Acquire, execute under the timeout, release.
    pub async fn query(&self, sql: &str) -> Result<RowSet> {
        let mut conn = self.acquire().await?;
        let result = conn.execute(sql, &[]).await;
        TimeoutPool::release(conn).await;
        result
    }
}

impl<C: Connection> Clone for TimeoutPool<C> {
    fn clone(&self) -> Self {
        TimeoutPool {
            pool: self.pool.clone(),
            timeout: self.timeout,
        }
    }
}
