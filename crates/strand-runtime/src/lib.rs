//! # strand-runtime
//!
//! Platform runtime for the strand fiber scheduler.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - Fiber stacks (mmap with guard page)
//! - The stackful `Fiber` task value
//! - A FIFO job pool over worker threads
//! - The I/O scheduler: fiber registry, epoll poller thread,
//!   suspend/resume plumbing

pub mod arch;
pub mod config;
pub mod fiber;
pub mod poller;
pub mod pool;
pub mod scheduler;
pub mod stack;
pub mod tls;

// Re-exports
pub use config::SchedulerConfig;
pub use fiber::Fiber;
pub use poller::Interest;
pub use pool::{JobPool, TaskHandle};
pub use scheduler::Scheduler;

// Platform detection: the poller is epoll-based
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        // supported
    } else {
        compile_error!("strand-runtime requires Linux (epoll)");
    }
}

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
