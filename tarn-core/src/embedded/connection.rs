//! Connections against the in-process engine.

use futures_core::future::BoxFuture;
use serde_json::Value;

use super::worker::Worker;
use crate::connection::{Connection, ConnectionId, PreparedStatement, StatementBackend};
use crate::error::Result;
use crate::result_set::RowSet;
use crate::stream::QueryStream;

/// A session against the in-process engine, backed by its own worker
/// thread over a clone of the root database connection.
pub struct EmbeddedConnection {
    worker: Worker,
    id: ConnectionId,
}

impl EmbeddedConnection {
    pub(crate) fn new(worker: Worker, id: ConnectionId) -> Self {
        EmbeddedConnection { worker, id }
    }
}

impl Connection for EmbeddedConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn execute<'c>(&'c mut self, sql: &'c str, params: &'c [Value]) -> BoxFuture<'c, Result<RowSet>> {
        Box::pin(async move {
            self.worker
                .execute(sql, params.to_vec())
                .await
                .map_err(|e| e.with_sql(sql).with_connection(self.id.clone()))
        })
    }

    fn stream<'c>(&'c mut self, sql: &'c str, params: &'c [Value]) -> BoxFuture<'c, Result<QueryStream>> {
        Box::pin(async move {
            // the in-process engine streams as a single yield of the
            // materialized result
            let rows = self
                .worker
                .execute(sql, params.to_vec())
                .await
                .map_err(|e| e.with_sql(sql).with_connection(self.id.clone()))?;
            Ok(QueryStream::from_batch_set(rows.to_batch_set()?))
        })
    }

    fn prepare<'c>(&'c mut self, sql: &'c str) -> BoxFuture<'c, Result<PreparedStatement>> {
        Box::pin(async move {
            let statement = self.worker.prepare(sql).await.map_err(|e| e.with_sql(sql))?;
            Ok(PreparedStatement::new(
                format!("embedded-stmt-{statement}"),
                Box::new(EmbeddedStatementBackend {
                    worker: self.worker.clone(),
                    statement,
                }),
            ))
        })
    }

    fn ping(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.worker.ping())
    }

    fn close(self) -> BoxFuture<'static, Result<()>> {
        let worker = self.worker;
        Box::pin(async move { worker.shutdown().await })
    }
}

pub(crate) struct EmbeddedStatementBackend {
    worker: Worker,
    statement: u64,
}

impl EmbeddedStatementBackend {
    pub(crate) fn new(worker: Worker, statement: u64) -> Self {
        EmbeddedStatementBackend { worker, statement }
    }
}

impl StatementBackend for EmbeddedStatementBackend {
    fn query<'s>(&'s self, params: &'s [Value]) -> BoxFuture<'s, Result<RowSet>> {
        Box::pin(self.worker.statement_query(self.statement, params.to_vec()))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.worker.statement_close(self.statement))
    }
}
