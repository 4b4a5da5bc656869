//! Connections and prepared statements over the IPC channel.

use std::sync::Arc;

use futures_core::future::BoxFuture;
use serde_json::{json, Value};

use super::transport::IpcTransport;
use super::{invoke, open_stream, prepare_backend_statement, row_set_from};
use crate::connection::{Connection, ConnectionId, PreparedStatement, StatementBackend};
use crate::error::{Error, Result};
use crate::result_set::RowSet;
use crate::stream::QueryStream;

/// A lightweight wrapper over a backend connection id.
pub struct IpcConnection {
    transport: Arc<dyn IpcTransport>,
    id: ConnectionId,
}

impl IpcConnection {
    pub(crate) fn new(transport: Arc<dyn IpcTransport>, id: impl Into<String>) -> Self {
        IpcConnection {
            transport,
            id: ConnectionId::new(id),
        }
    }
}

impl Connection for IpcConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn execute<'c>(&'c mut self, sql: &'c str, params: &'c [Value]) -> BoxFuture<'c, Result<RowSet>> {
        Box::pin(async move {
            let args = json!({
                "connection_id": self.id.as_str(),
                "sql": sql,
                "params": params,
            });

            let value = invoke(&*self.transport, "connection_execute", args)
                .await
                .map_err(|e| e.with_sql(sql).with_connection(self.id.clone()))?;
            row_set_from(value)
        })
    }

    fn stream<'c>(&'c mut self, sql: &'c str, params: &'c [Value]) -> BoxFuture<'c, Result<QueryStream>> {
        Box::pin(async move {
            if !params.is_empty() {
                return Err(Error::query(
                    "streaming queries over ipc do not accept bound parameters",
                )
                .with_sql(sql));
            }

            // streams are backend-managed and not tied to this session
            open_stream(Arc::clone(&self.transport), sql, &[]).await
        })
    }

    fn prepare<'c>(&'c mut self, sql: &'c str) -> BoxFuture<'c, Result<PreparedStatement>> {
        Box::pin(prepare_backend_statement(&self.transport, sql))
    }

    fn ping(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let args = json!({
                "connection_id": self.id.as_str(),
                "sql": "SELECT 1",
                "params": [],
            });
            invoke(&*self.transport, "connection_execute", args).await?;
            Ok(())
        })
    }

    fn close(self) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            invoke(
                &*self.transport,
                "connection_close",
                json!({ "connection_id": self.id.as_str() }),
            )
            .await?;
            Ok(())
        })
    }
}

pub(crate) struct IpcStatementBackend {
    transport: Arc<dyn IpcTransport>,
    statement_id: String,
}

impl IpcStatementBackend {
    pub(crate) fn new(transport: Arc<dyn IpcTransport>, statement_id: String) -> Self {
        IpcStatementBackend {
            transport,
            statement_id,
        }
    }
}

impl StatementBackend for IpcStatementBackend {
    fn query<'s>(&'s self, params: &'s [Value]) -> BoxFuture<'s, Result<RowSet>> {
        Box::pin(async move {
            let args = json!({
                "statement_id": self.statement_id,
                "params": params,
            });
            let value = invoke(&*self.transport, "prepared_statement_execute", args).await?;
            row_set_from(value)
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            invoke(
                &*self.transport,
                "prepared_statement_close",
                json!({ "statement_id": self.statement_id }),
            )
            .await?;
            Ok(())
        })
    }
}
