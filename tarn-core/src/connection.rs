//! The connection contract shared by every backend.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_core::future::BoxFuture;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::result_set::RowSet;
use crate::stream::QueryStream;

/// Opaque identifier of one session. Backend-owned for IPC connections,
/// locally assigned for in-process ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        ConnectionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single session against an engine.
///
/// A connection has exactly one owner at any time: the client that acquired
/// it from a pool, or the pool itself while idle.
pub trait Connection: Send + 'static {
    fn id(&self) -> &ConnectionId;

    /// Execute a query and materialize the full result.
    fn execute<'c>(&'c mut self, sql: &'c str, params: &'c [Value]) -> BoxFuture<'c, Result<RowSet>>;

    /// Execute a query as a lazy sequence of record batches.
    ///
    /// The in-process backend yields the whole result as a single batch;
    /// the IPC backend yields as many batches as the engine emits. Consumers
    /// must handle both uniformly.
    fn stream<'c>(&'c mut self, sql: &'c str, params: &'c [Value]) -> BoxFuture<'c, Result<QueryStream>>;

    fn prepare<'c>(&'c mut self, sql: &'c str) -> BoxFuture<'c, Result<PreparedStatement>>;

    /// Cheap round-trip used by on-acquire validation.
    fn ping(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Whether this session is still usable. Closed connections are never
    /// re-pooled.
    fn is_open(&self) -> bool {
        true
    }

    fn close(self) -> BoxFuture<'static, Result<()>>
    where
        Self: Sized;
}

/// Backend half of a [`PreparedStatement`].
pub trait StatementBackend: Send + Sync + 'static {
    fn query<'s>(&'s self, params: &'s [Value]) -> BoxFuture<'s, Result<RowSet>>;
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// A statement prepared once and executable many times.
///
/// Statement ids are opaque strings owned by the backend. `close` is
/// idempotent: the second and later calls are client-side no-ops, and the
/// backend tolerates a double release.
pub struct PreparedStatement {
    id: String,
    backend: Box<dyn StatementBackend>,
    closed: AtomicBool,
}

impl PreparedStatement {
    pub fn new(id: impl Into<String>, backend: Box<dyn StatementBackend>) -> Self {
        PreparedStatement {
            id: id.into(),
            backend,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn query(&self, params: &[Value]) -> Result<RowSet> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::query("prepared statement is closed"));
        }
        self.backend.query(params).await
    }

    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.backend.close().await
    }
}

impl fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// A connection to _any_ engine backend.
pub struct AnyConnection(pub(crate) AnyConnectionKind);

pub(crate) enum AnyConnectionKind {
    #[cfg(feature = "embedded")]
    Embedded(crate::embedded::EmbeddedConnection),

    #[cfg(feature = "ipc")]
    Ipc(crate::ipc::IpcConnection),
}

macro_rules! delegate {
    ($self:ident, $conn:ident => $body:expr) => {
        match &mut $self.0 {
            #[cfg(feature = "embedded")]
            AnyConnectionKind::Embedded($conn) => $body,

            #[cfg(feature = "ipc")]
            AnyConnectionKind::Ipc($conn) => $body,

            #[allow(unreachable_patterns)]
            _ => unreachable!("no engine backend enabled"),
        }
    };
}

impl Connection for AnyConnection {
    fn id(&self) -> &ConnectionId {
        match &self.0 {
            #[cfg(feature = "embedded")]
            AnyConnectionKind::Embedded(conn) => conn.id(),

            #[cfg(feature = "ipc")]
            AnyConnectionKind::Ipc(conn) => conn.id(),

            #[allow(unreachable_patterns)]
            _ => unreachable!("no engine backend enabled"),
        }
    }

    fn execute<'c>(&'c mut self, sql: &'c str, params: &'c [Value]) -> BoxFuture<'c, Result<RowSet>> {
        delegate!(self, conn => conn.execute(sql, params))
    }

    fn stream<'c>(&'c mut self, sql: &'c str, params: &'c [Value]) -> BoxFuture<'c, Result<QueryStream>> {
        delegate!(self, conn => conn.stream(sql, params))
    }

    fn prepare<'c>(&'c mut self, sql: &'c str) -> BoxFuture<'c, Result<PreparedStatement>> {
        delegate!(self, conn => conn.prepare(sql))
    }

    fn ping(&mut self) -> BoxFuture<'_, Result<()>> {
        delegate!(self, conn => conn.ping())
    }

    fn is_open(&self) -> bool {
        match &self.0 {
            #[cfg(feature = "embedded")]
            AnyConnectionKind::Embedded(conn) => conn.is_open(),

            #[cfg(feature = "ipc")]
            AnyConnectionKind::Ipc(conn) => conn.is_open(),

            #[allow(unreachable_patterns)]
            _ => unreachable!("no engine backend enabled"),
        }
    }

    fn close(self) -> BoxFuture<'static, Result<()>> {
        match self.0 {
            #[cfg(feature = "embedded")]
            AnyConnectionKind::Embedded(conn) => conn.close(),

            #[cfg(feature = "ipc")]
            AnyConnectionKind::Ipc(conn) => conn.close(),

            #[allow(unreachable_patterns)]
            _ => unreachable!("no engine backend enabled"),
        }
    }
}

impl fmt::Debug for AnyConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyConnection").field("id", self.id()).finish()
    }
}
