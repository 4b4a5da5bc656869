//! The in-process engine.
//!
//! The embedded engine runs DuckDB on dedicated worker threads inside this
//! process: one root worker owns the database handle, and every connection
//! adopts a clone of the root session on a thread of its own.

mod connection;
mod worker;

pub use connection::EmbeddedConnection;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_core::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;

use self::worker::Worker;
use crate::capabilities::{EngineCapabilities, FileFormat};
use crate::config::{EngineConfig, EngineKind, ExtensionKind, Persistence};
use crate::connection::{AnyConnection, AnyConnectionKind, ConnectionId, PreparedStatement};
use crate::engine::{
    Engine, ExtensionInfo, ExtensionOptions, FileRegistration, FileSource, FileSourceKind,
    RegisteredFile,
};
use crate::error::{Error, Result};
use crate::pool::{Pool, PoolOptions};
use crate::result_set::RowSet;
use crate::stream::{attach_statements, quote_ident, quote_literal, AttachSpec, QueryStream};

pub(crate) static CAPABILITIES: EngineCapabilities = EngineCapabilities {
    streaming: true,
    multi_threaded: true,
    // queries must go through registered handles or urls, never raw paths
    direct_file_access: false,
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
        "spatial",
        "sqlite_scanner",
    ],
};

const BOOTSTRAP_PROBE_SQL: &str = "CREATE OR REPLACE TABLE bootstrap_probe AS SELECT 1 AS ok; \
     DROP TABLE bootstrap_probe; \
     CHECKPOINT;";

struct EngineState {
    worker: Option<Worker>,
    extensions: Vec<ExtensionInfo>,
}

struct FileEntry {
    kind: FileSourceKind,
    location: Option<String>,
    /// Held open for the registration's lifetime.
    #[allow(dead_code)]
    handle: Option<std::fs::File>,
    /// Whether a view was materialized for this entry.
    view: bool,
}

/// An engine running inside this process.
pub struct EmbeddedEngine {
    config: EngineConfig,
    state: Mutex<EngineState>,
    files: Mutex<HashMap<String, FileEntry>>,
    ready: AtomicBool,
    connection_counter: Arc<AtomicU64>,
}

impl EmbeddedEngine {
    pub fn new(config: EngineConfig) -> Self {
        EmbeddedEngine {
            config,
            state: Mutex::new(EngineState {
                worker: None,
                extensions: Vec::new(),
            }),
            files: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(false),
            connection_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn worker(&self) -> Result<Worker> {
        let state = self.state.lock().await;
        state
            .worker
            .clone()
            .ok_or_else(|| Error::init("engine is not initialized"))
    }
}

async fn install_and_load(
    worker: &Worker,
    name: &str,
    kind: ExtensionKind,
    options: Option<&ExtensionOptions>,
) -> Result<()> {
    let ident = quote_ident(name);

    let mut install = String::new();
    if options.map_or(false, |o| o.force_install) {
        install.push_str("FORCE ");
    }
    install.push_str("INSTALL ");
    install.push_str(&ident);

    if let Some(repository) = options.and_then(|o| o.repository.as_deref()) {
        install.push_str(" FROM ");
        install.push_str(&quote_literal(repository));
    } else if kind == ExtensionKind::Community {
        install.push_str(" FROM community");
    }

    let sql = format!("{install}; LOAD {ident};");
    worker.execute_batch(&sql).await
}

impl Engine for EmbeddedEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Embedded
    }

    fn capabilities(&self) -> &EngineCapabilities {
        &CAPABILITIES
    }

    fn system_database_name(&self) -> String {
        match &self.config.persistence {
            Persistence::InMemory => "memory".to_owned(),
            Persistence::File { path } => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "memory".to_owned()),
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.worker.is_some() {
                return Ok(());
            }

            let worker =
                Worker::establish("tarn-embedded-root".into(), self.config.persistence.clone())
                    .await?;

            if self.config.persistence.is_persistent() {
                // one trivial DDL round-trip so the first checkpoint takes
                // effect on the backing file
                worker.execute_batch(BOOTSTRAP_PROBE_SQL).await?;
            }

            for extension in &self.config.extensions {
                install_and_load(&worker, &extension.name, extension.kind, None).await?;
                state.extensions.push(ExtensionInfo {
                    name: extension.name.clone(),
                    loaded: true,
                });
            }

            state.worker = Some(worker);
            self.ready.store(true, Ordering::Release);
            log::info!("embedded engine ready ({})", self.config.cache_key());
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ready.store(false, Ordering::Release);
            self.files.lock().await.clear();

            let worker = self.state.lock().await.worker.take();
            match worker {
                Some(worker) => worker.shutdown().await,
                None => Ok(()),
            }
        })
    }

    fn create_connection(&self) -> BoxFuture<'_, Result<AnyConnection>> {
        Box::pin(async move {
            let root = self.worker().await?;
            let conn = root.clone_connection().await?;

            let n = self.connection_counter.fetch_add(1, Ordering::Relaxed);
            let worker = Worker::adopt(format!("tarn-embedded-{n}"), conn)?;

            Ok(AnyConnection(AnyConnectionKind::Embedded(
                EmbeddedConnection::new(worker, ConnectionId::new(format!("embedded-{n}"))),
            )))
        })
    }

    fn create_pool(&self, size: Option<u32>) -> BoxFuture<'_, Result<Pool<AnyConnection>>> {
        Box::pin(async move {
            let mut options = PoolOptions::tuned(EngineKind::Embedded);
            if let Some(tuning) = &self.config.pool {
                options = options.merge(tuning);
            }
            if let Some(max) = size {
                options.max_size = max;
                options.min_size = options.min_size.min(max);
            }

            let root = self.worker().await?;
            let counter = Arc::clone(&self.connection_counter);

            let connector_root = root.clone();
            let connector: crate::pool::Connector<AnyConnection> =
                Arc::new(move || -> BoxFuture<'static, Result<AnyConnection>> {
                    let root = connector_root.clone();
                    let counter = Arc::clone(&counter);
                    Box::pin(async move {
                        let conn = root.clone_connection().await?;
                        let n = counter.fetch_add(1, Ordering::Relaxed);
                        let worker = Worker::adopt(format!("tarn-embedded-{n}"), conn)?;
                        Ok(AnyConnection(AnyConnectionKind::Embedded(
                            EmbeddedConnection::new(
                                worker,
                                ConnectionId::new(format!("embedded-{n}")),
                            ),
                        )))
                    })
                });

            let streamer_root = root;
            let streamer: crate::pool::Streamer =
                Arc::new(move |sql: String| -> BoxFuture<'static, Result<QueryStream>> {
                    let worker = streamer_root.clone();
                    Box::pin(async move {
                        let rows = worker.execute(&sql, Vec::new()).await?;
                        Ok(QueryStream::from_batch_set(rows.to_batch_set()?))
                    })
                });

            Pool::build(options, connector, Some(streamer))
        })
    }

    fn execute<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<RowSet>> {
        Box::pin(async move {
            let worker = self.worker().await?;
            worker
                .execute(sql, params.to_vec())
                .await
                .map_err(|e| e.with_sql(sql))
        })
    }

    fn stream<'a>(
        &'a self,
        sql: &'a str,
        attach: &'a [AttachSpec],
    ) -> BoxFuture<'a, Result<QueryStream>> {
        Box::pin(async move {
            let worker = self.worker().await?;

            for statement in attach_statements(attach) {
                worker.execute_batch(&statement).await?;
            }

            // single-yield: the whole result as one batch
            let rows = worker
                .execute(sql, Vec::new())
                .await
                .map_err(|e| e.with_sql(sql))?;
            Ok(QueryStream::from_batch_set(rows.to_batch_set()?))
        })
    }

    fn prepare<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<PreparedStatement>> {
        Box::pin(async move {
            let worker = self.worker().await?;
            let statement = worker.prepare(sql).await.map_err(|e| e.with_sql(sql))?;
            Ok(PreparedStatement::new(
                format!("embedded-stmt-{statement}"),
                Box::new(connection::EmbeddedStatementBackend::new(worker, statement)),
            ))
        })
    }

    fn register_file(&self, registration: FileRegistration) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let FileRegistration { name, source } = registration;

            let entry = match source {
                FileSource::Path(path) => {
                    return Err(Error::file_at(
                        format!("cannot register '{name}': the in-process engine accepts handles and urls only"),
                        path,
                    ));
                }
                FileSource::Url(url) => {
                    let worker = self.worker().await?;
                    let sql = format!(
                        "CREATE OR REPLACE VIEW {} AS SELECT * FROM {}",
                        quote_ident(&name),
                        quote_literal(url.as_str())
                    );
                    worker.execute_batch(&sql).await?;

                    FileEntry {
                        kind: FileSourceKind::Url,
                        location: Some(url.into()),
                        handle: None,
                        view: true,
                    }
                }
                FileSource::Handle(file) => FileEntry {
                    kind: FileSourceKind::Handle,
                    location: None,
                    handle: Some(file),
                    view: false,
                },
            };

            self.files.lock().await.insert(name, entry);
            Ok(())
        })
    }

    fn drop_file<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let entry = self
                .files
                .lock()
                .await
                .remove(name)
                .ok_or_else(|| Error::file(format!("no file registered as '{name}'")))?;

            if entry.view {
                let worker = self.worker().await?;
                worker
                    .execute_batch(&format!("DROP VIEW IF EXISTS {}", quote_ident(name)))
                    .await?;
            }
            Ok(())
        })
    }

    fn list_files(&self) -> BoxFuture<'_, Result<Vec<RegisteredFile>>> {
        Box::pin(async move {
            let files = self.files.lock().await;
            let mut listing: Vec<RegisteredFile> = files
                .iter()
                .map(|(name, entry)| RegisteredFile {
                    name: name.clone(),
                    kind: entry.kind,
                    location: entry.location.clone(),
                })
                .collect();
            listing.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(listing)
        })
    }

    fn checkpoint(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let worker = self.worker().await?;
            worker.execute_batch("CHECKPOINT;").await
        })
    }

    fn load_extension<'a>(
        &'a self,
        name: &'a str,
        options: Option<ExtensionOptions>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let worker = self.worker().await?;
            install_and_load(&worker, name, ExtensionKind::Core, options.as_ref()).await?;

            let mut state = self.state.lock().await;
            if !state.extensions.iter().any(|e| e.name == name) {
                state.extensions.push(ExtensionInfo {
                    name: name.to_owned(),
                    loaded: true,
                });
            }
            Ok(())
        })
    }

    fn list_extensions(&self) -> BoxFuture<'_, Result<Vec<ExtensionInfo>>> {
        Box::pin(async move { Ok(self.state.lock().await.extensions.clone()) })
    }
}
