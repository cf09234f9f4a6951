//! Engine configuration handling

use std::time::Duration;

use smart_default::SmartDefault;
use thiserror::Error;

use crate::concurrency::VersionedArc;

/// Tunables of the overlay engine.
#[derive(Clone, Eq, PartialEq, Debug, SmartDefault)]
pub struct EngineConfig {
    /// Default number of chunks started per viewer on every dispatch tick, stages can override it.
    #[default = 4]
    pub chunks_per_tick: u32,
    /// Copy the light captured in terrain snapshots into synthesized columns instead of letting clients recompute it.
    #[default = false]
    pub preserve_lighting: bool,
    /// Cadence of the dispatch scheduler.
    #[default(Duration::from_millis(50))]
    pub tick_period: Duration,
    /// How often the overlay cache is swept for empty entries.
    #[default(Duration::from_secs(30))]
    pub sweep_interval: Duration,
    /// Async worker threads of the chunk worker pool.
    #[default = 2]
    pub worker_threads: usize,
    /// Upper bound of threads running chunk synthesis, which may block on terrain I/O.
    #[default = 8]
    pub max_blocking_threads: usize,
    /// How long shutdown waits for queued synthesis work before abandoning it.
    #[default(Duration::from_secs(5))]
    pub shutdown_timeout: Duration,
    /// Capacity of the recently used (viewer, chunk) overlay slice cache.
    #[default = 256]
    pub recent_chunk_capacity: usize,
    /// Maximum number of idle objects kept by each buffer pool.
    #[default = 64]
    pub pool_capacity: usize,
}

/// A configuration value failed validation.
#[derive(Clone, Eq, PartialEq, Debug, Error)]
#[error("Configuration value `{field}` must be positive, got {value}")]
pub struct ConfigError {
    /// Name of the rejected field
    pub field: &'static str,
    /// The rejected value, formatted
    pub value: String,
}

/// A shared configuration handle, updated as a whole and read through snapshots.
pub type ConfigHandle = VersionedArc<EngineConfig>;

impl EngineConfig {
    /// Checks that every count and duration is positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive<T: PartialEq + Default + std::fmt::Debug>(field: &'static str, value: T) -> Result<(), ConfigError> {
            if value == T::default() {
                Err(ConfigError {
                    field,
                    value: format!("{value:?}"),
                })
            } else {
                Ok(())
            }
        }
        positive("chunks_per_tick", self.chunks_per_tick)?;
        positive("tick_period", self.tick_period)?;
        positive("sweep_interval", self.sweep_interval)?;
        positive("worker_threads", self.worker_threads)?;
        positive("max_blocking_threads", self.max_blocking_threads)?;
        positive("shutdown_timeout", self.shutdown_timeout)?;
        positive("recent_chunk_capacity", self.recent_chunk_capacity)?;
        positive("pool_capacity", self.pool_capacity)?;
        Ok(())
    }

    /// Validates this configuration and wraps it in a [`ConfigHandle`].
    pub fn into_handle(self) -> Result<ConfigHandle, ConfigError> {
        self.validate()?;
        Ok(ConfigHandle::new(self))
    }
}
