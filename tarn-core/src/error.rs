//! Error and Result types.

use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::connection::ConnectionId;

/// A specialized `Result` type for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Convenience alias for a type-erased error.
pub type BoxDynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A generic error that represents all the ways a method can fail inside of
/// the engine runtime.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The engine could not be constructed or initialized.
    #[error("error initializing engine: {message}")]
    Init {
        message: String,
        #[source]
        source: Option<BoxDynError>,
    },

    /// A configuration value was rejected before any engine work began.
    #[error("configuration error: {0}")]
    Configuration(Cow<'static, str>),

    /// Establishing or handing out a connection failed.
    #[error("failed to acquire a connection: {message}")]
    Acquire {
        message: String,
        #[source]
        source: Option<BoxDynError>,
    },

    /// A [Pool::acquire][crate::pool::Pool::acquire] timed out while parked
    /// in the wait queue.
    #[error("timed out waiting for a connection after {timeout:?}")]
    PoolTimedOut { timeout: Duration },

    /// The pool is at capacity and its wait queue is full.
    #[error("connection pool is exhausted ({max_waiting} clients already waiting)")]
    PoolExhausted { max_waiting: usize },

    /// [Pool::close][crate::pool::Pool::close] was called while we were
    /// waiting in [Pool::acquire][crate::pool::Pool::acquire].
    #[error("attempted to acquire a connection on a closed pool")]
    PoolClosed,

    /// An error was returned by the engine while executing a query.
    #[error("query execution failed: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        connection_id: Option<ConnectionId>,
        #[source]
        source: Option<BoxDynError>,
    },

    /// A timeout-wrapped operation did not complete within its budget.
    ///
    /// Detection-only on backends that cannot interrupt a running query; the
    /// engine may keep computing after the client gives up.
    #[error("query did not complete within {timeout:?}")]
    QueryTimedOut { timeout: Duration },

    /// The caller's cancellation token fired before the operation finished.
    #[error("query aborted")]
    Aborted,

    /// A catalog object was missing or invalid.
    #[error("catalog error: {message}")]
    Catalog { message: String },

    /// A file registration or file-backed operation failed.
    #[error("file operation failed: {message}")]
    File {
        message: String,
        path: Option<PathBuf>,
    },

    /// The engine ran out of memory.
    #[error("out of memory: {message}")]
    OutOfMemory { message: String },

    /// The background worker thread for an in-process connection died.
    #[error("background worker crashed")]
    WorkerCrashed,

    /// Unexpected or invalid data crossed the backend boundary.
    #[error("unexpected response from backend: {0}")]
    Protocol(Box<str>),

    /// An error that could not be classified.
    #[error("{message}")]
    Unknown { message: String },
}

/// The taxonomy an [`Error`] belongs to.
///
/// The three pool-tier kinds form the `CONNECTION_POOL` group; they are the
/// only recoverable kinds and the only ones the retry layer will act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Init,
    Acquisition,
    Timeout,
    PoolExhausted,
    Query,
    Catalog,
    File,
    OutOfMemory,
    Unknown,
}

impl ErrorKind {
    /// Stable machine-readable code for this kind.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Init => "INIT",
            ErrorKind::Acquisition => "ACQUISITION",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::PoolExhausted => "POOL_EXHAUSTED",
            ErrorKind::Query => "QUERY_EXECUTION",
            ErrorKind::Catalog => "CATALOG",
            ErrorKind::File => "FILE_OPERATION",
            ErrorKind::OutOfMemory => "OUT_OF_MEMORY",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Whether this kind belongs to the `CONNECTION_POOL` super-kind.
    pub fn is_connection_pool(self) -> bool {
        matches!(
            self,
            ErrorKind::Acquisition | ErrorKind::Timeout | ErrorKind::PoolExhausted
        )
    }

    /// Whether the retry layer may attempt the failed operation again
    /// without further user action.
    pub fn is_recoverable(self) -> bool {
        self.is_connection_pool()
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Init { .. } | Error::Configuration(_) => ErrorKind::Init,
            Error::Acquire { .. } | Error::PoolClosed => ErrorKind::Acquisition,
            Error::PoolTimedOut { .. } => ErrorKind::Timeout,
            Error::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Error::Query { .. } | Error::QueryTimedOut { .. } | Error::Aborted => ErrorKind::Query,
            Error::Catalog { .. } => ErrorKind::Catalog,
            Error::File { .. } => ErrorKind::File,
            Error::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Error::WorkerCrashed | Error::Protocol(_) | Error::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind().is_recoverable()
    }

    /// The query text attached to this error, if any.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }

    /// The message with sensitive fragments scrubbed; what a component
    /// re-emitting engine errors into user-facing surfaces should show.
    pub fn user_message(&self) -> String {
        scrub_message(&self.to_string())
    }

    pub(crate) fn init(message: impl Into<String>) -> Self {
        Error::Init {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn init_with(message: impl Into<String>, source: impl Into<BoxDynError>) -> Self {
        Error::Init {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub(crate) fn config(message: impl Into<Cow<'static, str>>) -> Self {
        Error::Configuration(message.into())
    }

    pub(crate) fn acquire(message: impl Into<String>) -> Self {
        Error::Acquire {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn acquire_with(message: impl Into<String>, source: Error) -> Self {
        Error::Acquire {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub(crate) fn query(message: impl Into<String>) -> Self {
        Error::Query {
            message: message.into(),
            sql: None,
            connection_id: None,
            source: None,
        }
    }

    pub(crate) fn with_sql(mut self, text: impl Into<String>) -> Self {
        if let Error::Query { sql, .. } = &mut self {
            *sql = Some(text.into());
        }
        self
    }

    pub(crate) fn with_connection(mut self, id: ConnectionId) -> Self {
        if let Error::Query { connection_id, .. } = &mut self {
            *connection_id = Some(id);
        }
        self
    }

    pub(crate) fn catalog(message: impl Into<String>) -> Self {
        Error::Catalog {
            message: message.into(),
        }
    }

    pub(crate) fn file(message: impl Into<String>) -> Self {
        Error::File {
            message: message.into(),
            path: None,
        }
    }

    pub(crate) fn file_at(message: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Error::File {
            message: message.into(),
            path: Some(path.into()),
        }
    }

    pub(crate) fn protocol(message: impl Into<Box<str>>) -> Self {
        Error::Protocol(message.into())
    }

    pub(crate) fn unknown(message: impl Into<String>) -> Self {
        Error::Unknown {
            message: message.into(),
        }
    }
}

/// Structured error payload produced by the native host.
///
/// `{"type": "QueryError", "details": {"message": …, "sql": …, "path": …}}`
#[derive(Deserialize)]
struct HostErrorPayload {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    details: HostErrorDetails,
}

#[derive(Deserialize, Default)]
struct HostErrorDetails {
    message: Option<String>,
    sql: Option<String>,
    path: Option<String>,
}

/// Translate a raw error payload received over the IPC boundary.
///
/// A JSON `{type, details}` record is decoded first; anything else falls
/// back to substring matching on well-known engine error prefixes.
pub fn parse_host_error(raw: &str) -> Error {
    if let Ok(payload) = serde_json::from_str::<HostErrorPayload>(raw) {
        let message = payload
            .details
            .message
            .unwrap_or_else(|| payload.kind.clone());

        return match payload.kind.as_str() {
            "QueryError" | "ExecutionError" => {
                let mut error = Error::query(message);
                if let Some(sql) = payload.details.sql {
                    error = error.with_sql(sql);
                }
                error
            }
            "CatalogError" => Error::catalog(message),
            "IoError" | "FileError" => Error::File {
                message,
                path: payload.details.path.map(Into::into),
            },
            "OutOfMemoryError" => Error::OutOfMemory { message },
            "InitError" => Error::init(message),
            "PoolError" => Error::acquire(message),
            _ => parse_engine_error(&message),
        };
    }

    parse_engine_error(raw)
}

/// Classify a raw engine error string by its well-known message prefix.
pub fn parse_engine_error(raw: &str) -> Error {
    if raw.contains("Catalog Error") {
        Error::catalog(raw)
    } else if raw.contains("Parser Error") || raw.contains("Binder Error") {
        Error::query(raw)
    } else if raw.contains("IO Error") {
        Error::file(raw)
    } else if raw.contains("Out of Memory") {
        Error::OutOfMemory {
            message: raw.to_owned(),
        }
    } else {
        Error::unknown(raw)
    }
}

static SCRUB_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(?i)bearer\s+[A-Za-z0-9._\-]+").unwrap(),
            "bearer [redacted]",
        ),
        (Regex::new(r"sk-[A-Za-z0-9]{8,}").unwrap(), "[redacted]"),
        (
            Regex::new(r"(?:/home/|/Users/)[^\s'\x22]+").unwrap(),
            "[path]",
        ),
        (
            Regex::new(r"[A-Za-z]:\\Users\\[^\s'\x22]+").unwrap(),
            "[path]",
        ),
    ]
});

/// Remove token fragments and filesystem paths from an error message before
/// it reaches a user-facing surface.
pub fn scrub_message(message: &str) -> String {
    let mut scrubbed = message.to_owned();
    for (pattern, replacement) in SCRUB_PATTERNS.iter() {
        scrubbed = pattern.replace_all(&scrubbed, *replacement).into_owned();
    }
    scrubbed
}
