//! Configuration types for runtime, throttling, output and replication settings

use crate::error::Error;

/// Default read/write chunk used by file transfers
pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;
/// Default number of jobs that may wait in the queue before the tree walk blocks
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
/// Default number of concurrent copy workers
pub const DEFAULT_WORKERS: usize = 8;

/// Settings for a single tree replication
#[derive(Debug, Clone, Copy)]
pub struct ReplicateSettings {
    /// Number of concurrent copy workers (must be > 0)
    pub workers: usize,
    /// Capacity of the bounded job queue (must be > 0)
    pub queue_capacity: usize,
    /// Chunk size used by each file transfer (bytes, must be > 0)
    pub chunk_size: usize,
}

impl Default for ReplicateSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ReplicateSettings {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::InvalidConfiguration(
                "worker count must be greater than 0".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfiguration(
                "queue capacity must be greater than 0".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfiguration(
                "chunk size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of open files (None or 0 = no limit)
    pub max_open_files: Option<usize>,
    /// Walked entries per second (0 = no throttle)
    pub ops_throttle: usize,
    /// Transferred chunks per second (0 = no throttle)
    pub iops_throttle: usize,
}

impl ThrottleConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        // tokens are replenished every 100ms, anything slower rounds down to zero
        for (name, value) in [
            ("ops_throttle", self.ops_throttle),
            ("iops_throttle", self.iops_throttle),
        ] {
            if value > 0 && value < crate::throttle::REPLENISH_PER_SEC {
                return Err(format!(
                    "{name} must be 0 or at least {}",
                    crate::throttle::REPLENISH_PER_SEC
                ));
            }
        }
        Ok(())
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}
