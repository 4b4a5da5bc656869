//! The polymorphic engine facade.

mod factory;

pub use factory::EngineFactory;

use std::fmt;
use std::path::PathBuf;

use futures_core::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capabilities::EngineCapabilities;
use crate::catalog::{self, DatabaseModel};
use crate::config::EngineKind;
use crate::connection::{AnyConnection, PreparedStatement};
use crate::error::Result;
use crate::pool::Pool;
use crate::result_set::{ColumnInfo, RowSet};
use crate::stream::{AttachSpec, QueryStream};

/// How a registered file is addressed.
#[derive(Debug)]
pub enum FileSource {
    /// An opaque host-provided file handle; in-process engines only.
    Handle(std::fs::File),
    /// An absolute URL fetched by the engine's http loader.
    Url(url::Url),
    /// A local filesystem path; IPC engines only.
    Path(PathBuf),
}

impl FileSource {
    pub fn kind(&self) -> FileSourceKind {
        match self {
            FileSource::Handle(_) => FileSourceKind::Handle,
            FileSource::Url(_) => FileSourceKind::Url,
            FileSource::Path(_) => FileSourceKind::Path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSourceKind {
    Handle,
    Url,
    Path,
}

/// A request to make a file addressable under a logical name.
#[derive(Debug)]
pub struct FileRegistration {
    pub name: String,
    pub source: FileSource,
}

impl FileRegistration {
    pub fn url(name: impl Into<String>, url: url::Url) -> Self {
        FileRegistration {
            name: name.into(),
            source: FileSource::Url(url),
        }
    }

    pub fn path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        FileRegistration {
            name: name.into(),
            source: FileSource::Path(path.into()),
        }
    }

    pub fn handle(name: impl Into<String>, file: std::fs::File) -> Self {
        FileRegistration {
            name: name.into(),
            source: FileSource::Handle(file),
        }
    }
}

/// One entry of the engine's file registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredFile {
    pub name: String,
    pub kind: FileSourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Options for loading one engine extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionOptions {
    /// Alternate repository to install from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default)]
    pub force_install: bool,
}

/// One installed extension, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    pub name: String,
    pub loaded: bool,
}

/// The uniform runtime surface over any backend.
///
/// All operations are async; errors carry the taxonomy in
/// [`ErrorKind`][crate::error::ErrorKind].
pub trait Engine: Send + Sync + 'static {
    fn kind(&self) -> EngineKind;

    /// Immutable capability record for this engine variant.
    fn capabilities(&self) -> &EngineCapabilities;

    /// The name under which this backend exposes its own database; catalog
    /// shaping normalizes it to [`CANONICAL_DATABASE`][catalog::CANONICAL_DATABASE].
    fn system_database_name(&self) -> String;

    fn is_ready(&self) -> bool;

    /// Bring the engine up. Idempotent: a second call is a no-op.
    fn initialize(&self) -> BoxFuture<'_, Result<()>>;

    fn shutdown(&self) -> BoxFuture<'_, Result<()>>;

    fn create_connection(&self) -> BoxFuture<'_, Result<AnyConnection>>;

    /// Create a pool over this engine. `size`, when given, overrides the
    /// tuned maximum size.
    fn create_pool(&self, size: Option<u32>) -> BoxFuture<'_, Result<Pool<AnyConnection>>>;

    /// Execute against an engine-managed session and materialize the result.
    fn execute<'a>(&'a self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, Result<RowSet>>;

    /// Stream a query, attaching auxiliary databases first.
    ///
    /// The in-process engine yields a single batch; the IPC engine yields as
    /// many as the backend emits. This difference is observable and
    /// intentional — buffering to normalize it would defeat streaming.
    fn stream<'a>(
        &'a self,
        sql: &'a str,
        attach: &'a [AttachSpec],
    ) -> BoxFuture<'a, Result<QueryStream>>;

    fn prepare<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<PreparedStatement>>;

    fn register_file(&self, registration: FileRegistration) -> BoxFuture<'_, Result<()>>;

    fn drop_file<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;

    fn list_files(&self) -> BoxFuture<'_, Result<Vec<RegisteredFile>>>;

    /// Persist engine state, when the backend supports it.
    fn checkpoint(&self) -> BoxFuture<'_, Result<()>>;

    fn load_extension<'a>(
        &'a self,
        name: &'a str,
        options: Option<ExtensionOptions>,
    ) -> BoxFuture<'a, Result<()>>;

    fn list_extensions(&self) -> BoxFuture<'_, Result<Vec<ExtensionInfo>>>;

    /// The full catalog, shaped into the uniform [`DatabaseModel`].
    fn catalog(&self) -> BoxFuture<'_, Result<DatabaseModel>> {
        Box::pin(catalog::load_catalog(self))
    }

    fn databases(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(catalog::list_databases(self))
    }

    fn tables<'a>(&'a self, database: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(catalog::list_tables(self, database))
    }

    fn columns<'a>(
        &'a self,
        database: &'a str,
        table: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ColumnInfo>>> {
        Box::pin(catalog::list_columns(self, database, table))
    }
}

impl fmt::Debug for dyn Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("kind", &self.kind())
            .field("ready", &self.is_ready())
            .finish()
    }
}
