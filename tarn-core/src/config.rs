//! Engine configuration.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::pool::PoolTuning;

/// Which backend variant an engine runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// The engine runs inside this process, on a dedicated worker thread.
    Embedded,
    /// The engine runs in a native host reached over an IPC channel.
    Ipc,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineKind::Embedded => "embedded",
            EngineKind::Ipc => "ipc",
        })
    }
}

/// Where the engine keeps its database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persistence {
    InMemory,
    File { path: PathBuf },
}

impl Persistence {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Persistence::File { path: path.into() }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Persistence::InMemory => None,
            Persistence::File { path } => Some(path),
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, Persistence::File { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            Persistence::InMemory => "memory",
            Persistence::File { .. } => "file",
        }
    }
}

/// Which repository an engine extension is installed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionKind {
    Core,
    Community,
}

/// One extension to load during engine initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionSpec {
    pub name: String,
    pub kind: ExtensionKind,
}

impl ExtensionSpec {
    pub fn core(name: impl Into<String>) -> Self {
        ExtensionSpec {
            name: name.into(),
            kind: ExtensionKind::Core,
        }
    }

    pub fn community(name: impl Into<String>) -> Self {
        ExtensionSpec {
            name: name.into(),
            kind: ExtensionKind::Community,
        }
    }
}

/// Everything needed to construct and initialize one engine.
///
/// Two configurations are equal iff `(kind, persistence)` are equal; the
/// endpoint, extension list, and pool tuning do not participate in identity,
/// so the factory hands back the cached engine for a config that differs
/// only in those.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub persistence: Persistence,
    /// Backend locator: the worker bundle for hosted deployments, or the
    /// native host endpoint for IPC. Interpreted by the host, not by us.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<ExtensionSpec>,
    /// Overrides applied on top of the engine-tuned pool defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolTuning>,
}

impl EngineConfig {
    /// An in-process engine over an in-memory database.
    pub fn in_memory() -> Self {
        EngineConfig {
            kind: EngineKind::Embedded,
            persistence: Persistence::InMemory,
            endpoint: None,
            extensions: Vec::new(),
            pool: None,
        }
    }

    /// An in-process engine over a file-backed database.
    pub fn file_backed(path: impl Into<PathBuf>) -> Self {
        EngineConfig {
            persistence: Persistence::file(path),
            ..EngineConfig::in_memory()
        }
    }

    /// An IPC engine; persistence is managed by the native host.
    pub fn ipc() -> Self {
        EngineConfig {
            kind: EngineKind::Ipc,
            ..EngineConfig::in_memory()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_extension(mut self, extension: ExtensionSpec) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn with_pool(mut self, tuning: PoolTuning) -> Self {
        self.pool = Some(tuning);
        self
    }

    /// The factory cache key: `kind | persistence | path-or-"default"`.
    pub fn cache_key(&self) -> String {
        let path = self
            .persistence
            .path()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_owned());

        format!("{}|{}|{}", self.kind, self.persistence.label(), path)
    }
}

impl PartialEq for EngineConfig {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.persistence == other.persistence
    }
}

impl Eq for EngineConfig {}

impl Hash for EngineConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.persistence.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_ignores_endpoint_and_extensions() {
        let a = EngineConfig::in_memory().with_extension(ExtensionSpec::core("json"));
        let b = EngineConfig::in_memory().with_endpoint("ipc://local");
        assert_eq!(a, b);
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn identity_distinguishes_kind_and_path() {
        let memory = EngineConfig::in_memory();
        let file = EngineConfig::file_backed("/tmp/analytics.db");
        let ipc = EngineConfig::ipc();

        assert_ne!(memory, file);
        assert_ne!(memory, ipc);
        assert_eq!(memory.cache_key(), "embedded|memory|default");
        assert_eq!(file.cache_key(), "embedded|file|/tmp/analytics.db");
        assert_eq!(ipc.cache_key(), "ipc|memory|default");
    }
}
