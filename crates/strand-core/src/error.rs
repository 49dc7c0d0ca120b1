//! Error types for the strand scheduler

use crate::state::FiberState;
use core::fmt;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler operations
///
/// Syscall-level failures in the socket adapter are reported as
/// `std::io::Error` by `strand-net`; this enum covers misuse of the
/// runtime itself and resource failures inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Operation requires a running fiber and was called from plain
    /// thread context
    NotAFiber,

    /// The fiber id is not in the scheduler registry
    FiberNotFound,

    /// The fiber is in the wrong state for the requested transition
    InvalidState(FiberState),

    /// A completion callback was already installed for this generation
    CompletionAlreadySet,

    /// Job submitted to a stopped pool
    PoolStopped,

    /// The packaged task panicked before producing a result
    TaskPanicked,

    /// Scheduler configuration failed validation
    InvalidConfig(&'static str),

    /// A global scheduler is already installed
    AlreadyInstalled,

    /// No global scheduler has been installed
    NotInstalled,

    /// Fiber stack allocation failed
    StackAllocationFailed,

    /// An OS call inside the runtime failed with the given errno
    Os(i32),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::NotAFiber => write!(f, "not running on a fiber"),
            SchedError::FiberNotFound => write!(f, "fiber not found in registry"),
            SchedError::InvalidState(s) => write!(f, "invalid fiber state: {}", s),
            SchedError::CompletionAlreadySet => {
                write!(f, "completion callback already set")
            }
            SchedError::PoolStopped => write!(f, "job submitted to stopped pool"),
            SchedError::TaskPanicked => write!(f, "packaged task panicked"),
            SchedError::InvalidConfig(reason) => {
                write!(f, "invalid scheduler configuration: {}", reason)
            }
            SchedError::AlreadyInstalled => write!(f, "scheduler already installed"),
            SchedError::NotInstalled => write!(f, "scheduler not installed"),
            SchedError::StackAllocationFailed => {
                write!(f, "fiber stack allocation failed")
            }
            SchedError::Os(errno) => write!(f, "os error: errno {}", errno),
        }
    }
}

impl std::error::Error for SchedError {}

impl From<std::io::Error> for SchedError {
    fn from(e: std::io::Error) -> Self {
        SchedError::Os(e.raw_os_error().unwrap_or(0))
    }
}
