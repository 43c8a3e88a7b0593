//! Configuration consumed by the exporter.
//!
//! [`ExportConfig`] is an explicit value passed at construction; there is no
//! process-wide default instance. Build it with struct-update syntax over
//! [`ExportConfig::default`] or through [`ExportConfigBuilder`], which
//! validates every field before handing the config out.

use std::{path::PathBuf, time::Duration};

use crate::{error::BuildError, rate_limited_warner::DEFAULT_WARN_INTERVAL};

/// Default bounded queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8192;
/// Default number of items per transmit call.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
/// Default wait before a partial batch is exported.
pub const DEFAULT_EXPORT_INTERVAL: Duration = Duration::from_secs(15);
/// Default bound on how long `flush` waits for acknowledgement.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound on how long `close` waits for the worker to drain.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// Default number of stored blobs replayed after a successful export.
pub const DEFAULT_REPLAY_LIMIT: usize = 10;
/// Default overflow store size cap (50 MiB).
pub const DEFAULT_STORAGE_MAX_SIZE: u64 = 50 * 1024 * 1024;
/// Default interval between maintenance sweeps.
pub const DEFAULT_MAINTENANCE_PERIOD: Duration = Duration::from_secs(60);
/// Default maximum blob age (7 days).
pub const DEFAULT_RETENTION_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Default age after which orphaned temporary files are removed.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Settings for the disk-backed overflow store.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageConfig {
    /// Directory holding blob files. Created on demand.
    pub path: PathBuf,
    /// Byte cap across every file in `path`.
    pub max_size: u64,
    /// Interval between retention and cleanup sweeps.
    pub maintenance_period: Duration,
    /// Blobs older than this are never replayed and are deleted.
    pub retention_period: Duration,
    /// Temporary files older than this are assumed orphaned.
    pub write_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("femtoexport"),
            max_size: DEFAULT_STORAGE_MAX_SIZE,
            maintenance_period: DEFAULT_MAINTENANCE_PERIOD,
            retention_period: DEFAULT_RETENTION_PERIOD,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl StorageConfig {
    /// Default settings rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), BuildError> {
        if self.path.as_os_str().is_empty() {
            return Err(BuildError::InvalidConfig(
                "storage path must not be empty".into(),
            ));
        }
        ensure_positive(self.max_size, "storage_max_size")?;
        ensure_positive_duration(self.maintenance_period, "storage_maintenance_period")?;
        ensure_positive_duration(self.retention_period, "storage_retention_period")?;
        ensure_positive_duration(self.write_timeout, "storage_write_timeout")?;
        Ok(())
    }
}

/// Configuration for one exporter instance.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportConfig {
    /// Items held in the queue before `emit` starts dropping.
    pub queue_capacity: usize,
    /// Items per dequeued batch and per transmit call.
    pub max_batch_size: usize,
    /// Longest wait before a partial batch is exported.
    pub export_interval: Duration,
    /// Fraction in `[0, 1]` of emitted items admitted to the queue.
    pub sampling_probability: f64,
    /// Bound on how long `flush` blocks.
    pub flush_timeout: Duration,
    /// Bound on how long `close` blocks.
    pub shutdown_timeout: Duration,
    /// Stored blobs replayed per round after a successful export.
    pub replay_limit: usize,
    /// Whether failed batches are retained on disk.
    pub enable_local_storage: bool,
    pub storage: StorageConfig,
    /// Interval between rate-limited drop warnings.
    pub warn_interval: Duration,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            export_interval: DEFAULT_EXPORT_INTERVAL,
            sampling_probability: 1.0,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            replay_limit: DEFAULT_REPLAY_LIMIT,
            enable_local_storage: true,
            storage: StorageConfig::default(),
            warn_interval: DEFAULT_WARN_INTERVAL,
        }
    }
}

impl ExportConfig {
    pub fn validate(&self) -> Result<(), BuildError> {
        ensure_positive(self.queue_capacity as u64, "queue_capacity")?;
        ensure_positive(self.max_batch_size as u64, "max_batch_size")?;
        ensure_positive(self.replay_limit as u64, "replay_limit")?;
        ensure_positive_duration(self.export_interval, "export_interval")?;
        ensure_positive_duration(self.flush_timeout, "flush_timeout")?;
        ensure_positive_duration(self.shutdown_timeout, "shutdown_timeout")?;
        if !(0.0..=1.0).contains(&self.sampling_probability) {
            return Err(BuildError::InvalidConfig(format!(
                "sampling_probability must be in the range [0, 1], got {}",
                self.sampling_probability
            )));
        }
        if self.enable_local_storage {
            self.storage.validate()?;
        }
        Ok(())
    }

    /// Storage settings, or `None` when local storage is disabled.
    pub fn storage(&self) -> Option<&StorageConfig> {
        self.enable_local_storage.then_some(&self.storage)
    }
}

fn ensure_positive(value: u64, field: &str) -> Result<u64, BuildError> {
    if value == 0 {
        Err(BuildError::InvalidConfig(format!(
            "{field} must be greater than zero"
        )))
    } else {
        Ok(value)
    }
}

fn ensure_positive_duration(value: Duration, field: &str) -> Result<Duration, BuildError> {
    if value.is_zero() {
        Err(BuildError::InvalidConfig(format!(
            "{field} must be greater than zero"
        )))
    } else {
        Ok(value)
    }
}

macro_rules! option_setter {
    ($(#[$meta:meta])* $fn_name:ident, $field:ident, $ty:ty) => {
        $(#[$meta])*
        pub fn $fn_name(mut self, value: $ty) -> Self {
            self.$field = Some(value);
            self
        }
    };
}

/// Builder for [`ExportConfig`].
///
/// Unset fields fall back to the defaults documented on the constants in
/// this module.
#[derive(Clone, Debug, Default)]
pub struct ExportConfigBuilder {
    queue_capacity: Option<usize>,
    max_batch_size: Option<usize>,
    export_interval: Option<Duration>,
    sampling_probability: Option<f64>,
    flush_timeout: Option<Duration>,
    shutdown_timeout: Option<Duration>,
    replay_limit: Option<usize>,
    enable_local_storage: Option<bool>,
    storage_path: Option<PathBuf>,
    storage_max_size: Option<u64>,
    storage_maintenance_period: Option<Duration>,
    storage_retention_period: Option<Duration>,
    storage_write_timeout: Option<Duration>,
    warn_interval: Option<Duration>,
}

impl ExportConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    option_setter!(
        #[doc = "Set the bounded queue capacity."]
        with_queue_capacity,
        queue_capacity,
        usize
    );
    option_setter!(
        #[doc = "Set the maximum number of items per batch."]
        with_max_batch_size,
        max_batch_size,
        usize
    );
    option_setter!(
        #[doc = "Set the longest wait before a partial batch is exported."]
        with_export_interval,
        export_interval,
        Duration
    );
    option_setter!(
        #[doc = "Set the fraction of emitted items admitted to the queue."]
        with_sampling_probability,
        sampling_probability,
        f64
    );
    option_setter!(
        #[doc = "Set how long `flush` waits for acknowledgement."]
        with_flush_timeout,
        flush_timeout,
        Duration
    );
    option_setter!(
        #[doc = "Set how long `close` waits for the worker to drain."]
        with_shutdown_timeout,
        shutdown_timeout,
        Duration
    );
    option_setter!(
        #[doc = "Set how many stored blobs are replayed per round."]
        with_replay_limit,
        replay_limit,
        usize
    );
    option_setter!(
        #[doc = "Enable or disable the disk-backed overflow store."]
        with_local_storage,
        enable_local_storage,
        bool
    );
    option_setter!(
        #[doc = "Set the byte cap for the overflow store."]
        with_storage_max_size,
        storage_max_size,
        u64
    );
    option_setter!(
        #[doc = "Set the interval between storage maintenance sweeps."]
        with_storage_maintenance_period,
        storage_maintenance_period,
        Duration
    );
    option_setter!(
        #[doc = "Set the maximum age of a stored blob."]
        with_storage_retention_period,
        storage_retention_period,
        Duration
    );
    option_setter!(
        #[doc = "Set the age after which temporary files are considered orphaned."]
        with_storage_write_timeout,
        storage_write_timeout,
        Duration
    );
    option_setter!(
        #[doc = "Set the interval between rate-limited drop warnings."]
        with_warn_interval,
        warn_interval,
        Duration
    );

    /// Set the directory used by the overflow store.
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Validate the collected options and produce an [`ExportConfig`].
    pub fn build(&self) -> Result<ExportConfig, BuildError> {
        let defaults = ExportConfig::default();
        let storage = StorageConfig {
            path: self
                .storage_path
                .clone()
                .unwrap_or(defaults.storage.path.clone()),
            max_size: self.storage_max_size.unwrap_or(defaults.storage.max_size),
            maintenance_period: self
                .storage_maintenance_period
                .unwrap_or(defaults.storage.maintenance_period),
            retention_period: self
                .storage_retention_period
                .unwrap_or(defaults.storage.retention_period),
            write_timeout: self
                .storage_write_timeout
                .unwrap_or(defaults.storage.write_timeout),
        };
        let config = ExportConfig {
            queue_capacity: self.queue_capacity.unwrap_or(defaults.queue_capacity),
            max_batch_size: self.max_batch_size.unwrap_or(defaults.max_batch_size),
            export_interval: self.export_interval.unwrap_or(defaults.export_interval),
            sampling_probability: self
                .sampling_probability
                .unwrap_or(defaults.sampling_probability),
            flush_timeout: self.flush_timeout.unwrap_or(defaults.flush_timeout),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(defaults.shutdown_timeout),
            replay_limit: self.replay_limit.unwrap_or(defaults.replay_limit),
            enable_local_storage: self
                .enable_local_storage
                .unwrap_or(defaults.enable_local_storage),
            storage,
            warn_interval: self.warn_interval.unwrap_or(defaults.warn_interval),
        };
        config.validate()?;
        Ok(config)
    }
}
