//! Capability reporting.
//!
//! Each engine publishes an immutable capability record; UI layers consult
//! it to decide which affordances to show.

use serde::Serialize;

/// A file format an engine can register and query directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Csv,
    Tsv,
    Parquet,
    Json,
    Arrow,
    Duckdb,
}

/// What one engine variant can do. Immutable once published.
#[derive(Debug, Clone, Serialize)]
pub struct EngineCapabilities {
    /// Multi-batch streaming of query results.
    pub streaming: bool,
    pub multi_threaded: bool,
    /// Queries may reference local filesystem paths directly.
    pub direct_file_access: bool,
    pub extensions: bool,
    pub persistence: bool,
    /// Queries may reference remote (http) files.
    pub remote_files: bool,
    /// Upper bound on registered file size, when the backend imposes one.
    pub max_file_size: Option<u64>,
    pub formats: &'static [FileFormat],
    pub allowed_extensions: &'static [&'static str],
}

impl EngineCapabilities {
    pub fn supports_format(&self, format: FileFormat) -> bool {
        self.formats.contains(&format)
    }

    pub fn allows_extension(&self, name: &str) -> bool {
        self.allowed_extensions.iter().any(|n| *n == name)
    }
}
