//! Configuration surface for the concurrency primitives.
//!
//! Every section deserializes with defaults for missing fields, so a partial
//! TOML document is enough. Durations are written in milliseconds.
//!
//! Two levels of checking are available:
//!
//! - [`normalized`](WorkerPoolConfig::normalized) clamps non-positive values
//!   to a safe minimum and logs a warning for each clamp. Every constructor in
//!   `vigil_concurrency` applies it, so a zero worker count becomes one worker.
//! - [`validate`](WorkerPoolConfig::validate) rejects the same values with a
//!   [`ConfigError::Invalid`] for callers that want misconfiguration to fail.
//!
//! # Examples
//!
//! ```
//! use vigil_core::config::VigilConfig;
//!
//! let config = VigilConfig::from_toml_str(
//!     r#"
//!     [batch]
//!     max_batch_size = 25
//!     max_wait_time_ms = 50
//!
//!     [connection_pool]
//!     min_size = 1
//!     max_size = 4
//!     "#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.batch.max_batch_size, 25);
//! assert_eq!(config.connection_pool.max_size, 4);
//! assert_eq!(config.pipeline.workers, num_cpus::get());
//! ```

use crate::error::ConfigError;
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest duration any timer or timeout is clamped to.
pub const MIN_DURATION: Duration = Duration::from_millis(1);

/// Serde helpers that store a `Duration` as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

fn clamp_count(section: &str, field: &str, value: usize) -> usize {
    if value == 0 {
        warn!("{}.{} is 0, clamping to 1", section, field);
        1
    } else {
        value
    }
}

fn clamp_duration(section: &str, field: &str, value: Duration) -> Duration {
    if value < MIN_DURATION {
        warn!(
            "{}.{} is {:?}, clamping to {:?}",
            section, field, value, MIN_DURATION
        );
        MIN_DURATION
    } else {
        value
    }
}

fn require_positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

fn require_duration(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value < MIN_DURATION {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("must be at least {:?}", MIN_DURATION),
        });
    }
    Ok(())
}

/// Configuration for a worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of executor threads
    pub workers: usize,

    /// Capacity of the task queue
    pub queue_size: usize,

    /// Capacity of the result queue
    pub result_buffer: usize,

    /// Capacity of the error queue
    pub error_buffer: usize,

    /// Name prefix for executor threads
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_size: 1000,
            result_buffer: 1000,
            error_buffer: 100,
            thread_name_prefix: "vigil-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    /// Clamp every non-positive value to its minimum.
    pub fn normalized(mut self) -> Self {
        self.workers = clamp_count("worker", "workers", self.workers);
        self.queue_size = clamp_count("worker", "queue_size", self.queue_size);
        self.result_buffer = clamp_count("worker", "result_buffer", self.result_buffer);
        self.error_buffer = clamp_count("worker", "error_buffer", self.error_buffer);
        self
    }

    /// Reject non-positive values instead of clamping them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("worker.workers", self.workers)?;
        require_positive("worker.queue_size", self.queue_size)?;
        require_positive("worker.result_buffer", self.result_buffer)?;
        require_positive("worker.error_buffer", self.error_buffer)
    }
}

/// Configuration for a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of transform workers
    pub workers: usize,

    /// Capacity of the input queue
    pub input_buffer: usize,

    /// Capacity of the result queue
    pub output_buffer: usize,

    /// Capacity of the error queue
    pub error_buffer: usize,

    /// Name prefix for worker threads
    pub thread_name_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            input_buffer: 100,
            output_buffer: 100,
            error_buffer: 100,
            thread_name_prefix: "vigil-pipeline".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Clamp every non-positive value to its minimum.
    pub fn normalized(mut self) -> Self {
        self.workers = clamp_count("pipeline", "workers", self.workers);
        self.input_buffer = clamp_count("pipeline", "input_buffer", self.input_buffer);
        self.output_buffer = clamp_count("pipeline", "output_buffer", self.output_buffer);
        self.error_buffer = clamp_count("pipeline", "error_buffer", self.error_buffer);
        self
    }

    /// Reject non-positive values instead of clamping them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("pipeline.workers", self.workers)?;
        require_positive("pipeline.input_buffer", self.input_buffer)?;
        require_positive("pipeline.output_buffer", self.output_buffer)?;
        require_positive("pipeline.error_buffer", self.error_buffer)
    }
}

/// Configuration for a batch processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// A batch is flushed as soon as it holds this many items
    pub max_batch_size: usize,

    /// A batch is flushed this long after its first item arrived
    #[serde(rename = "max_wait_time_ms", with = "duration_ms")]
    pub max_wait_time: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_wait_time: Duration::from_millis(100),
        }
    }
}

impl BatchConfig {
    /// Clamp every non-positive value to its minimum.
    pub fn normalized(mut self) -> Self {
        self.max_batch_size = clamp_count("batch", "max_batch_size", self.max_batch_size);
        self.max_wait_time = clamp_duration("batch", "max_wait_time", self.max_wait_time);
        self
    }

    /// Reject non-positive values instead of clamping them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("batch.max_batch_size", self.max_batch_size)?;
        require_duration("batch.max_wait_time", self.max_wait_time)
    }
}

/// Configuration for a connection pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    /// Connections created up front and never evicted by the idle sweep
    pub min_size: usize,

    /// Upper bound on idle plus in-use connections
    pub max_size: usize,

    /// How long a connection may sit idle before the sweep may close it
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,

    /// How often the idle sweep runs
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,

    /// Default wait used by `get_default_timeout`
    #[serde(rename = "acquire_timeout_ms", with = "duration_ms")]
    pub acquire_timeout: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionPoolConfig {
    /// Clamp every non-positive value to its minimum and raise `max_size` to
    /// at least `min_size`.
    pub fn normalized(mut self) -> Self {
        self.max_size = clamp_count("connection_pool", "max_size", self.max_size);
        if self.min_size > self.max_size {
            warn!(
                "connection_pool.min_size {} exceeds max_size {}, raising max_size",
                self.min_size, self.max_size
            );
            self.max_size = self.min_size;
        }
        self.idle_timeout = clamp_duration("connection_pool", "idle_timeout", self.idle_timeout);
        self.sweep_interval =
            clamp_duration("connection_pool", "sweep_interval", self.sweep_interval);
        self.acquire_timeout =
            clamp_duration("connection_pool", "acquire_timeout", self.acquire_timeout);
        self
    }

    /// Reject non-positive values and `min_size > max_size`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("connection_pool.max_size", self.max_size)?;
        if self.min_size > self.max_size {
            return Err(ConfigError::Invalid {
                field: "connection_pool.min_size",
                reason: format!("{} exceeds max_size {}", self.min_size, self.max_size),
            });
        }
        require_duration("connection_pool.idle_timeout", self.idle_timeout)?;
        require_duration("connection_pool.sweep_interval", self.sweep_interval)?;
        require_duration("connection_pool.acquire_timeout", self.acquire_timeout)
    }
}

/// All recognized options, one section per primitive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    /// Worker pool section
    pub worker: WorkerPoolConfig,

    /// Pipeline section
    pub pipeline: PipelineConfig,

    /// Batch processor section
    pub batch: BatchConfig,

    /// Connection pool section
    pub connection_pool: ConnectionPoolConfig,
}

impl VigilConfig {
    /// Parse a TOML document. Missing sections and fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Render the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Clamp every section.
    pub fn normalized(self) -> Self {
        Self {
            worker: self.worker.normalized(),
            pipeline: self.pipeline.normalized(),
            batch: self.batch.normalized(),
            connection_pool: self.connection_pool.normalized(),
        }
    }

    /// Validate every section, stopping at the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.worker.validate()?;
        self.pipeline.validate()?;
        self.batch.validate()?;
        self.connection_pool.validate()
    }
}
