//! Construction and caching of initialized engines.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{Error, ErrorKind, Result};

#[cfg(feature = "ipc")]
use crate::ipc::transport::IpcTransport;

/// Creates engines on demand and caches them by configuration key.
///
/// Construct one factory at program start and share it; the cache is the
/// single owner of engine lifecycles.
pub struct EngineFactory {
    engines: Mutex<HashMap<String, Arc<dyn Engine>>>,
    #[cfg(feature = "ipc")]
    transport: Option<Arc<dyn IpcTransport>>,
}

impl EngineFactory {
    pub fn new() -> Self {
        EngineFactory {
            engines: Mutex::new(HashMap::new()),
            #[cfg(feature = "ipc")]
            transport: None,
        }
    }

    /// A factory that can construct IPC engines over the given transport.
    #[cfg(feature = "ipc")]
    pub fn with_transport(transport: Arc<dyn IpcTransport>) -> Self {
        EngineFactory {
            engines: Mutex::new(HashMap::new()),
            transport: Some(transport),
        }
    }

    /// Return the cached engine for this configuration, or construct and
    /// initialize a new one. Engines that stopped reporting ready are
    /// replaced.
    pub async fn create(&self, config: EngineConfig) -> Result<Arc<dyn Engine>> {
        let key = config.cache_key();
        let mut engines = self.engines.lock().await;

        if let Some(engine) = engines.get(&key) {
            if engine.is_ready() {
                return Ok(Arc::clone(engine));
            }
            engines.remove(&key);
        }

        let engine = self.construct(&config)?;
        engine.initialize().await.map_err(|e| {
            if e.kind() == ErrorKind::Init {
                e
            } else {
                Error::init_with("engine initialization failed", e)
            }
        })?;

        engines.insert(key, Arc::clone(&engine));
        Ok(engine)
    }

    fn construct(&self, config: &EngineConfig) -> Result<Arc<dyn Engine>> {
        match config.kind {
            #[cfg(feature = "embedded")]
            crate::config::EngineKind::Embedded => Ok(Arc::new(
                crate::embedded::EmbeddedEngine::new(config.clone()),
            )),

            #[cfg(feature = "ipc")]
            crate::config::EngineKind::Ipc => {
                let transport = self
                    .transport
                    .clone()
                    .ok_or_else(|| Error::init("no ipc transport installed in this factory"))?;
                Ok(Arc::new(crate::ipc::IpcEngine::new(
                    config.clone(),
                    transport,
                )))
            }

            #[allow(unreachable_patterns)]
            kind => Err(Error::init(format!(
                "engine kind '{kind}' is not supported by this build"
            ))),
        }
    }

    /// Probe the host environment and pick the best configuration: the IPC
    /// backend when a native host is reachable, file-backed persistence
    /// when the platform provides an application data directory.
    pub fn detect_optimal(&self) -> EngineConfig {
        #[cfg(feature = "ipc")]
        if self.transport.is_some() {
            return EngineConfig::ipc();
        }

        match dirs::data_local_dir() {
            Some(dir) => EngineConfig::file_backed(dir.join("tarn").join("analytics.db")),
            None => EngineConfig::in_memory(),
        }
    }

    /// Whether an engine for this configuration is currently cached.
    pub async fn is_cached(&self, config: &EngineConfig) -> bool {
        self.engines.lock().await.contains_key(&config.cache_key())
    }

    /// Shut down and remove one cached engine.
    pub async fn destroy(&self, config: &EngineConfig) -> Result<()> {
        let engine = self.engines.lock().await.remove(&config.cache_key());
        match engine {
            Some(engine) => engine.shutdown().await,
            None => Ok(()),
        }
    }

    /// Shut down every cached engine concurrently.
    pub async fn destroy_all(&self) {
        let engines: Vec<Arc<dyn Engine>> = {
            let mut cache = self.engines.lock().await;
            cache.drain().map(|(_, engine)| engine).collect()
        };

        let shutdowns = engines.iter().map(|engine| engine.shutdown());
        for result in futures_util::future::join_all(shutdowns).await {
            if let Err(error) = result {
                log::warn!("engine shutdown failed: {error}");
            }
        }
    }
}

impl Default for EngineFactory {
    fn default() -> Self {
        EngineFactory::new()
    }
}
