//! The IPC engine: a thin client over a native host process.
//!
//! Every operation is a `(command, args)` request over the transport,
//! wrapped in the error translator. Streaming queries run over the event
//! channel (§ [`crate::stream`]) and are not bound to a pooled connection.

pub mod transport;

mod connection;

pub use connection::IpcConnection;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_core::future::BoxFuture;
use serde_json::{json, Value};

use self::connection::IpcStatementBackend;
use self::transport::{HostError, IpcTransport};
use crate::capabilities::{EngineCapabilities, FileFormat};
use crate::config::{EngineConfig, EngineKind};
use crate::connection::{AnyConnection, AnyConnectionKind, PreparedStatement};
use crate::engine::{
    Engine, ExtensionInfo, ExtensionOptions, FileRegistration, FileSource, RegisteredFile,
};
use crate::error::{parse_host_error, Error, Result};
use crate::pool::{Pool, PoolOptions};
use crate::result_set::RowSet;
use crate::stream::{AttachSpec, QueryStream};

/// The reserved name under which the native host attaches its persistent
/// database. Catalog shaping maps it to the canonical name.
pub(crate) const SYSTEM_DATABASE: &str = "workspace";

pub(crate) static CAPABILITIES: EngineCapabilities = EngineCapabilities {
    streaming: true,
    multi_threaded: true,
    direct_file_access: true,
    extensions: true,
    persistence: true,
    remote_files: true,
    max_file_size: None,
    formats: &[
        FileFormat::Csv,
        FileFormat::Tsv,
        FileFormat::Parquet,
        FileFormat::Json,
        FileFormat::Arrow,
        FileFormat::Duckdb,
    ],
    allowed_extensions: &[
        "autocomplete",
        "excel",
        "fts",
        "httpfs",
        "icu",
        "json",
        "parquet",
        "postgres_scanner",
        "spatial",
        "sqlite_scanner",
    ],
};

/// Send one command to the host, translating failures into the taxonomy.
pub(crate) async fn invoke(
    transport: &dyn IpcTransport,
    command: &str,
    args: Value,
) -> Result<Value> {
    transport
        .invoke(command, args)
        .await
        .map_err(|HostError(raw)| parse_host_error(&raw))
}

pub(crate) fn row_set_from(value: Value) -> Result<RowSet> {
    if value.is_null() {
        return Ok(RowSet::empty());
    }
    serde_json::from_value(value)
        .map_err(|e| Error::protocol(format!("malformed query result from host: {e}")))
}

fn string_id_from(value: Value, keys: &[&str], what: &str) -> Result<String> {
    if let Some(id) = value.as_str() {
        return Ok(id.to_owned());
    }
    for key in keys {
        if let Some(id) = value.get(key).and_then(Value::as_str) {
            return Ok(id.to_owned());
        }
    }
    Err(Error::protocol(format!("host returned no {what}")))
}

pub(crate) async fn create_backend_connection(
    transport: &Arc<dyn IpcTransport>,
) -> Result<IpcConnection> {
    let value = invoke(&**transport, "create_connection", json!({})).await?;
    let id = string_id_from(value, &["connection_id", "id"], "connection id")?;
    Ok(IpcConnection::new(Arc::clone(transport), id))
}

pub(crate) async fn prepare_backend_statement(
    transport: &Arc<dyn IpcTransport>,
    sql: &str,
) -> Result<PreparedStatement> {
    let value = invoke(&**transport, "prepare_statement", json!({ "sql": sql })).await?;
    let id = string_id_from(value, &["statement_id", "id"], "statement id")?;

    Ok(PreparedStatement::new(
        id.clone(),
        Box::new(IpcStatementBackend::new(Arc::clone(transport), id)),
    ))
}

pub(crate) async fn open_stream(
    transport: Arc<dyn IpcTransport>,
    sql: &str,
    attach: &[AttachSpec],
) -> Result<QueryStream> {
    let stream_id = uuid::Uuid::new_v4().to_string();
    let reader = crate::stream::open_ipc_stream(transport, stream_id, sql, attach).await?;
    Ok(reader)
}

/// An engine hosted in the native process, reached over IPC.
pub struct IpcEngine {
    config: EngineConfig,
    transport: Arc<dyn IpcTransport>,
    ready: AtomicBool,
    /// Engine-managed session used for direct `execute` calls.
    system: tokio::sync::Mutex<Option<String>>,
}

impl IpcEngine {
    pub fn new(config: EngineConfig, transport: Arc<dyn IpcTransport>) -> Self {
        IpcEngine {
            config,
            transport,
            ready: AtomicBool::new(false),
            system: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn system_connection_id(&self) -> Result<String> {
        let mut slot = self.system.lock().await;
        if let Some(id) = slot.as_ref() {
            return Ok(id.clone());
        }

        let value = invoke(&*self.transport, "create_connection", json!({})).await?;
        let id = string_id_from(value, &["connection_id", "id"], "connection id")?;
        *slot = Some(id.clone());
        Ok(id)
    }
}

impl Engine for IpcEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Ipc
    }

    fn capabilities(&self) -> &EngineCapabilities {
        &CAPABILITIES
    }

    fn system_database_name(&self) -> String {
        SYSTEM_DATABASE.to_owned()
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.is_ready() {
                return Ok(());
            }

            // no dedicated handshake command exists; verify the channel
            // with a real round-trip before reporting ready
            invoke(&*self.transport, "get_databases", json!({}))
                .await
                .map_err(|e| Error::init_with("ipc backend is unreachable", e))?;

            self.ready.store(true, Ordering::Release);
            log::info!("ipc engine ready");
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ready.store(false, Ordering::Release);

            if let Some(id) = self.system.lock().await.take() {
                let _ = invoke(
                    &*self.transport,
                    "connection_close",
                    json!({ "connection_id": id }),
                )
                .await;
            }
            Ok(())
        })
    }

    fn create_connection(&self) -> BoxFuture<'_, Result<AnyConnection>> {
        Box::pin(async move {
            let conn = create_backend_connection(&self.transport).await?;
            Ok(AnyConnection(AnyConnectionKind::Ipc(conn)))
        })
    }

    fn create_pool(&self, size: Option<u32>) -> BoxFuture<'_, Result<Pool<AnyConnection>>> {
        Box::pin(async move {
            let mut options = PoolOptions::tuned(EngineKind::Ipc);
            if let Some(tuning) = &self.config.pool {
                options = options.merge(tuning);
            }
            if let Some(max) = size {
                options.max_size = max;
                options.min_size = options.min_size.min(max);
            }

            let connector_transport = Arc::clone(&self.transport);
            let connector: crate::pool::Connector<AnyConnection> =
                Arc::new(move || -> BoxFuture<'static, Result<AnyConnection>> {
                    let transport = Arc::clone(&connector_transport);
                    Box::pin(async move {
                        let conn = create_backend_connection(&transport).await?;
                        Ok(AnyConnection(AnyConnectionKind::Ipc(conn)))
                    })
                });

            let streamer_transport = Arc::clone(&self.transport);
            let streamer: crate::pool::Streamer =
                Arc::new(move |sql: String| -> BoxFuture<'static, Result<QueryStream>> {
                    let transport = Arc::clone(&streamer_transport);
                    Box::pin(async move { open_stream(transport, &sql, &[]).await })
                });

            let pool = Pool::build(options, connector, Some(streamer))?;
            Ok(pool)
        })
    }

    fn execute<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<RowSet>> {
        Box::pin(async move {
            let connection_id = self.system_connection_id().await?;
            let args = json!({
                "connection_id": connection_id,
                "sql": sql,
                "params": params,
            });

            let value = invoke(&*self.transport, "connection_execute", args)
                .await
                .map_err(|e| e.with_sql(sql))?;
            row_set_from(value)
        })
    }

    fn stream<'a>(
        &'a self,
        sql: &'a str,
        attach: &'a [AttachSpec],
    ) -> BoxFuture<'a, Result<QueryStream>> {
        Box::pin(open_stream(Arc::clone(&self.transport), sql, attach))
    }

    fn prepare<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<PreparedStatement>> {
        Box::pin(prepare_backend_statement(&self.transport, sql))
    }

    fn register_file(&self, registration: FileRegistration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let args = match &registration.source {
                FileSource::Handle(_) => {
                    // a host handle has no serializable representation
                    return Err(Error::file(format!(
                        "cannot register '{}': the ipc engine accepts urls and paths only",
                        registration.name
                    )));
                }
                FileSource::Url(url) => json!({
                    "name": registration.name,
                    "kind": "url",
                    "url": url.as_str(),
                }),
                FileSource::Path(path) => json!({
                    "name": registration.name,
                    "kind": "path",
                    "path": path,
                }),
            };

            invoke(&*self.transport, "register_file", args).await?;
            Ok(())
        })
    }

    fn drop_file<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            invoke(&*self.transport, "drop_file", json!({ "name": name })).await?;
            Ok(())
        })
    }

    fn list_files(&self) -> BoxFuture<'_, Result<Vec<RegisteredFile>>> {
        Box::pin(async move {
            let value = invoke(&*self.transport, "list_files", json!({})).await?;
            if value.is_null() {
                return Ok(Vec::new());
            }
            serde_json::from_value(value)
                .map_err(|e| Error::protocol(format!("malformed file listing from host: {e}")))
        })
    }

    fn checkpoint(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            invoke(&*self.transport, "checkpoint", json!({})).await?;
            Ok(())
        })
    }

    fn load_extension<'a>(
        &'a self,
        name: &'a str,
        options: Option<ExtensionOptions>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let args = json!({ "name": name, "options": options });
            invoke(&*self.transport, "load_extension", args).await?;
            Ok(())
        })
    }

    fn list_extensions(&self) -> BoxFuture<'_, Result<Vec<ExtensionInfo>>> {
        Box::pin(async move {
            let value = invoke(&*self.transport, "list_extensions", json!({})).await?;
            if value.is_null() {
                return Ok(Vec::new());
            }
            serde_json::from_value(value)
                .map_err(|e| Error::protocol(format!("malformed extension listing from host: {e}")))
        })
    }

    // Metadata lives behind dedicated commands on this backend; the host
    // returns shaped results and only the reserved database name needs
    // normalizing on receipt.

    fn catalog(&self) -> BoxFuture<'_, Result<crate::catalog::DatabaseModel>> {
        Box::pin(async move {
            let value = invoke(&*self.transport, "get_catalog", json!({})).await?;
            let model: crate::catalog::DatabaseModel = serde_json::from_value(value)
                .map_err(|e| Error::protocol(format!("malformed catalog from host: {e}")))?;
            Ok(crate::catalog::normalize_model(model, SYSTEM_DATABASE))
        })
    }

    fn databases(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let value = invoke(&*self.transport, "get_databases", json!({})).await?;
            let names: Vec<String> = serde_json::from_value(value)
                .map_err(|e| Error::protocol(format!("malformed database listing from host: {e}")))?;

            let mut databases: Vec<String> = names
                .iter()
                .map(|name| crate::catalog::normalize_database(name, SYSTEM_DATABASE))
                .collect();
            databases.sort();
            databases.dedup();
            Ok(databases)
        })
    }

    fn tables<'a>(&'a self, database: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let database = crate::catalog::denormalize_database(database, SYSTEM_DATABASE);
            let value = invoke(
                &*self.transport,
                "get_tables",
                json!({ "database": database }),
            )
            .await?;
            serde_json::from_value(value)
                .map_err(|e| Error::protocol(format!("malformed table listing from host: {e}")))
        })
    }

    fn columns<'a>(
        &'a self,
        database: &'a str,
        table: &'a str,
    ) -> BoxFuture<'a, Result<Vec<crate::result_set::ColumnInfo>>> {
        Box::pin(async move {
            let database = crate::catalog::denormalize_database(database, SYSTEM_DATABASE);
            let value = invoke(
                &*self.transport,
                "get_columns",
                json!({ "database": database, "table": table }),
            )
            .await?;
            serde_json::from_value(value)
                .map_err(|e| Error::protocol(format!("malformed column listing from host: {e}")))
        })
    }
}
