//! Scheduler configuration

use strand_core::constants::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads (defaults to CPU count)
    pub thread_count: usize,

    /// Stack size per fiber in bytes (default 1 MiB)
    pub stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            thread_count: num_cpus,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads
    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = n;
        self
    }

    /// Set the per-fiber stack size
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.thread_count == 0 {
            return Err("thread_count must be at least 1");
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err("stack_size below minimum");
        }
        Ok(())
    }
}
