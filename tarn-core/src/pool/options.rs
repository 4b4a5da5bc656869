//! Pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::EngineKind;
use crate::error::{Error, Result};

/// Trade-off presets applied on top of the engine-tuned defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    /// The engine-tuned defaults, unchanged.
    Balanced,
    /// More parallelism, less checking: double the pool, skip validation,
    /// retire idle connections sooner.
    Performance,
    /// Fewer, better-checked connections with more patience on acquire.
    Compatibility,
}

/// Configuration options for [`Pool`][crate::pool::Pool].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    pub min_size: u32,
    pub max_size: u32,
    /// How long an acquire may wait parked in the queue.
    pub acquire_timeout: Duration,
    /// Idle connections above `min_size` are closed after this long.
    /// Zero disables the idle reaper.
    pub idle_timeout: Duration,
    pub max_waiting_clients: usize,
    /// Run a cheap round-trip on idle connections before handing them out.
    pub validate_on_acquire: bool,
    /// Skip validation for connections idle less than this; zero validates
    /// every acquire.
    pub validation_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions::tuned(EngineKind::Embedded)
    }
}

impl PoolOptions {
    pub fn new() -> Self {
        PoolOptions::default()
    }

    /// The tuned defaults for one engine variant.
    pub fn tuned(kind: EngineKind) -> Self {
        match kind {
            EngineKind::Embedded => PoolOptions {
                min_size: 5,
                max_size: 30,
                acquire_timeout: Duration::from_millis(3_000),
                idle_timeout: Duration::from_millis(60_000),
                max_waiting_clients: 50,
                validate_on_acquire: false,
                validation_interval: Duration::ZERO,
            },
            EngineKind::Ipc => PoolOptions {
                min_size: 2,
                max_size: 10,
                acquire_timeout: Duration::from_millis(5_000),
                idle_timeout: Duration::from_millis(30_000),
                max_waiting_clients: 20,
                validate_on_acquire: true,
                validation_interval: Duration::ZERO,
            },
        }
    }

    pub fn mode(mut self, mode: PoolMode) -> Self {
        match mode {
            PoolMode::Balanced => {}
            PoolMode::Performance => {
                self.max_size = self.max_size.saturating_mul(2);
                self.validate_on_acquire = false;
                self.idle_timeout /= 2;
            }
            PoolMode::Compatibility => {
                self.max_size = (self.max_size / 2).max(1);
                self.min_size = self.min_size.min(self.max_size);
                self.validate_on_acquire = true;
                self.acquire_timeout = self.acquire_timeout.saturating_mul(2);
            }
        }
        self
    }

    pub fn min_size(mut self, min: u32) -> Self {
        self.min_size = min;
        self
    }

    pub fn max_size(mut self, max: u32) -> Self {
        self.max_size = max;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_waiting_clients(mut self, max: usize) -> Self {
        self.max_waiting_clients = max;
        self
    }

    pub fn validate_on_acquire(mut self, validate: bool) -> Self {
        self.validate_on_acquire = validate;
        self
    }

    pub fn validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval = interval;
        self
    }

    /// Apply caller overrides on top of these options.
    pub fn merge(mut self, tuning: &PoolTuning) -> Self {
        if let Some(mode) = tuning.mode {
            self = self.mode(mode);
        }
        if let Some(min) = tuning.min_size {
            self.min_size = min;
        }
        if let Some(max) = tuning.max_size {
            self.max_size = max;
        }
        if let Some(ms) = tuning.acquire_timeout_ms {
            self.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = tuning.idle_timeout_ms {
            self.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = tuning.max_waiting_clients {
            self.max_waiting_clients = max;
        }
        if let Some(validate) = tuning.validate_on_acquire {
            self.validate_on_acquire = validate;
        }
        // tuned minimums never override an explicit, smaller maximum
        if tuning.min_size.is_none() {
            self.min_size = self.min_size.min(self.max_size);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("pool max_size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(Error::config("pool min_size cannot exceed max_size"));
        }
        Ok(())
    }
}

/// Partial pool overrides carried on an engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTuning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PoolMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_waiting_clients: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_on_acquire: Option<bool>,
}
