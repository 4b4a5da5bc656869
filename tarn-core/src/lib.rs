//! Core of Tarn: a uniform async runtime for embedded columnar SQL engines.
//!
//! One set of operations — connect, execute, stream, prepare, register
//! files, introspect the catalog — over two backends:
//!
//! * [`embedded`]: the engine runs in this process on dedicated worker
//!   threads (feature `embedded`);
//! * [`ipc`]: the engine runs in a native host reached over an IPC channel
//!   (feature `ipc`).
//!
//! Around the backends sit a connection [`pool`], [`retry`] and [`timeout`]
//! wrappers, and a record-batch [`stream`]ing transport with
//! acknowledgement-window flow control.

#![forbid(unsafe_code)]

pub mod capabilities;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod pool;
pub mod result_set;
pub mod retry;
pub mod stream;
pub mod timeout;

#[cfg(feature = "embedded")]
pub mod embedded;

#[cfg(feature = "ipc")]
pub mod ipc;

pub use capabilities::{EngineCapabilities, FileFormat};
pub use catalog::{
    DatabaseEntry, DatabaseModel, ObjectEntry, ObjectKind, SchemaEntry, CANONICAL_DATABASE,
};
pub use config::{EngineConfig, EngineKind, ExtensionKind, ExtensionSpec, Persistence};
pub use connection::{AnyConnection, Connection, ConnectionId, PreparedStatement, StatementBackend};
pub use engine::{
    Engine, EngineFactory, ExtensionInfo, ExtensionOptions, FileRegistration, FileSource,
    FileSourceKind, RegisteredFile,
};
pub use error::{
    parse_engine_error, parse_host_error, scrub_message, BoxDynError, Error, ErrorKind, Result,
};
pub use pool::{Pool, PoolConnection, PoolMode, PoolOptions, PoolStats, PoolTuning};
pub use result_set::{BatchSet, ColumnInfo, Row, RowSet};
pub use retry::{retry, RetryPolicy, RetryingPool};
pub use stream::{AttachSpec, QueryStream};
pub use timeout::{TimeoutConnection, TimeoutPool};

#[cfg(feature = "embedded")]
pub use embedded::EmbeddedEngine;

#[cfg(feature = "ipc")]
pub use ipc::transport::{EventSubscription, HostError, IpcTransport, StreamEvent, StreamEventKind};

#[cfg(feature = "ipc")]
pub use ipc::IpcEngine;

// Re-exported so callers can speak the pool helper types without naming the
// underlying crates.
pub use either::Either;
pub use tokio_util::sync::CancellationToken;
