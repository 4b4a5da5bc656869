//! Pool of engine connections.
//!
//! The pool maintains between `min_size` and `max_size` live connections,
//! hands out exactly one owner per connection at a time, parks overflow
//! acquires in a bounded FIFO queue with a per-acquire timeout, and trims
//! idle connections back down on a timer. State mutations are serialized
//! under a fair async mutex; no lock is held across connection I/O beyond
//! the acquire/release bookkeeping.

mod inner;
mod options;

pub use options::{PoolMode, PoolOptions, PoolTuning};

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use either::Either;
use futures_core::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use self::inner::{Live, PoolInner};
use crate::connection::{Connection, ConnectionId, PreparedStatement};
use crate::error::{Error, Result};
use crate::result_set::RowSet;
use crate::stream::QueryStream;

/// Factory for new pooled connections.
pub type Connector<C> = Arc<dyn Fn() -> BoxFuture<'static, Result<C>> + Send + Sync>;

/// Hook used by [`Pool::send_abortable`] to open a backend-managed stream
/// without pinning a pooled connection for the stream's lifetime.
pub type Streamer = Arc<dyn Fn(String) -> BoxFuture<'static, Result<QueryStream>> + Send + Sync>;

/// A bounded pool of connections with ownership-transfer semantics.
///
/// Cloning is cheap; all clones share one pool.
pub struct Pool<C: Connection>(Arc<PoolInner<C>>);

impl<C: Connection> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Pool(Arc::clone(&self.0))
    }
}

impl<C: Connection> Pool<C> {
    /// Create a pool that opens connections on demand.
    pub fn new<F>(options: PoolOptions, connect: F) -> Result<Self>
    where
        F: Fn() -> BoxFuture<'static, Result<C>> + Send + Sync + 'static,
    {
        Pool::build(options, Arc::new(connect), None)
    }

    pub(crate) fn build(
        options: PoolOptions,
        connector: Connector<C>,
        streamer: Option<Streamer>,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Pool(PoolInner::new(options, connector, streamer)))
    }

    /// Create a pool and eagerly open `min_size` connections, best effort.
    pub async fn open<F>(options: PoolOptions, connect: F) -> Result<Self>
    where
        F: Fn() -> BoxFuture<'static, Result<C>> + Send + Sync + 'static,
    {
        let pool = Pool::new(options, connect)?;
        pool.0.prime().await;
        Ok(pool)
    }

    /// Retrieve a connection, waiting at most the configured acquire
    /// timeout if the pool is at capacity.
    pub async fn acquire(&self) -> Result<PoolConnection<C>> {
        self.0.acquire().await
    }

    /// Acquire, execute, release.
    pub async fn query(&self, sql: &str) -> Result<RowSet> {
        let mut conn = self.acquire().await?;
        let result = conn.execute(sql, &[]).await;
        conn.release().await;
        result
    }

    /// [`query`][Self::query], honoring a caller-provided cancellation
    /// token both before dispatch and while the work is in flight.
    pub async fn query_abortable(&self, sql: &str, cancel: &CancellationToken) -> Result<RowSet> {
        if cancel.is_cancelled() {
            return Err(Error::Aborted);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Aborted),
            result = self.query(sql) => result,
        }
    }

    /// Dispatch a query either as a stream (through the backend-managed
    /// streaming transport; no pooled connection is held for the stream's
    /// lifetime) or as a materialized result.
    pub async fn send_abortable(
        &self,
        sql: &str,
        cancel: &CancellationToken,
        stream: bool,
    ) -> Result<Either<RowSet, QueryStream>> {
        if !stream {
            return self.query_abortable(sql, cancel).await.map(Either::Left);
        }

        let streamer = self
            .0
            .streamer
            .clone()
            .ok_or_else(|| Error::config("this pool has no streaming transport"))?;

        if cancel.is_cancelled() {
            return Err(Error::Aborted);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Aborted),
            stream = (streamer)(sql.to_owned()) => stream.map(Either::Right),
        }
    }

    /// Close the pool: reject all waiters, close every idle connection, and
    /// close checked-out connections as they are returned. Counters remain
    /// readable afterwards.
    pub async fn close(&self) {
        self.0.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    pub fn options(&self) -> &PoolOptions {
        &self.0.options
    }

    /// A point-in-time snapshot of sizes and lifetime counters.
    pub async fn stats(&self) -> PoolStats {
        self.0.stats().await
    }
}

impl<C: Connection> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("is_closed", &self.is_closed())
            .field("options", self.options())
            .finish()
    }
}

/// Pool sizes and lifetime counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Connections currently owned by the pool (idle + checked out).
    pub size: u32,
    pub idle: usize,
    pub waiting: usize,
    pub created: u64,
    pub acquired: u64,
    pub released: u64,
    pub reaped: u64,
    pub acquire_timeouts: u64,
    pub validation_failures: u64,
    pub exhaustions: u64,
}

/// A connection checked out from a [`Pool`].
///
/// Returned to the pool on drop; use [`release`][Self::release] to return
/// it at a deterministic point, or [`Connection::close`] to take it out of
/// the pool for good.
pub struct PoolConnection<C: Connection> {
    live: Option<Live<C>>,
    pool: Arc<PoolInner<C>>,
}

const DEREF_ERR: &str = "(bug) connection already released to pool";

impl<C: Connection> PoolConnection<C> {
    pub(super) fn new(live: Live<C>, pool: Arc<PoolInner<C>>) -> Self {
        PoolConnection {
            live: Some(live),
            pool,
        }
    }

    /// Return the connection to the pool now.
    pub async fn release(mut self) {
        if let Some(live) = self.live.take() {
            Arc::clone(&self.pool).release(live).await;
        }
    }
}

impl<C: Connection> Deref for PoolConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.live.as_ref().expect(DEREF_ERR).raw
    }
}

impl<C: Connection> DerefMut for PoolConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.live.as_mut().expect(DEREF_ERR).raw
    }
}

impl<C: Connection> Connection for PoolConnection<C> {
    fn id(&self) -> &ConnectionId {
        self.live.as_ref().expect(DEREF_ERR).raw.id()
    }

    fn execute<'c>(&'c mut self, sql: &'c str, params: &'c [Value]) -> BoxFuture<'c, Result<RowSet>> {
        self.live.as_mut().expect(DEREF_ERR).raw.execute(sql, params)
    }

    fn stream<'c>(&'c mut self, sql: &'c str, params: &'c [Value]) -> BoxFuture<'c, Result<QueryStream>> {
        self.live.as_mut().expect(DEREF_ERR).raw.stream(sql, params)
    }

    fn prepare<'c>(&'c mut self, sql: &'c str) -> BoxFuture<'c, Result<PreparedStatement>> {
        self.live.as_mut().expect(DEREF_ERR).raw.prepare(sql)
    }

    fn ping(&mut self) -> BoxFuture<'_, Result<()>> {
        self.live.as_mut().expect(DEREF_ERR).raw.ping()
    }

    fn is_open(&self) -> bool {
        self.live.as_ref().map_or(false, |live| live.raw.is_open())
    }

    /// Detach the connection from the pool and close it for good.
    fn close(mut self) -> BoxFuture<'static, Result<()>> {
        let live = self.live.take();
        let pool = Arc::clone(&self.pool);

        Box::pin(async move {
            match live {
                Some(live) => pool.discard(live).await,
                None => Ok(()),
            }
        })
    }
}

/// Returns the connection to the pool it was checked out from.
impl<C: Connection> Drop for PoolConnection<C> {
    fn drop(&mut self) {
        if let Some(live) = self.live.take() {
            let pool = Arc::clone(&self.pool);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(pool.release(live));
            } else {
                log::warn!("pool connection dropped outside a runtime; discarding it");
            }
        }
    }
}

impl<C: Connection> fmt::Debug for PoolConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.live.as_ref().map(|live| live.raw.id());
        f.debug_struct("PoolConnection").field("id", &id).finish()
    }
}
