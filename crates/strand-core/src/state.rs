//! Fiber lifecycle states

use core::fmt;

/// State of a fiber
///
/// ```text
///            create              start
///    [none] ───────▶ Ready ─────────────▶ Running
///                      ▲                  │   │
///                 reuse│         yield    │   │ return
///                      │  Suspended ◀─────┘   ▼
///                      │       │            Terminated
///                      │       │ resume
///                      │       ▼
///                      └──────Running ──▶ Errored (uncaught panic)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Just created, context not yet primed
    Init = 0,

    /// Ready to be started for the first time (or after reuse)
    Ready = 1,

    /// Currently executing on a worker thread
    Running = 2,

    /// Yielded mid-execution, waiting to be resumed
    Suspended = 3,

    /// Task returned normally; eligible for stack reuse
    Terminated = 4,

    /// Task panicked; the payload is recorded on the fiber
    Errored = 5,
}

impl FiberState {
    /// Check if the fiber can be started
    #[inline]
    pub const fn is_ready(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    /// Check if the fiber has reached a terminal state
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, FiberState::Terminated | FiberState::Errored)
    }

    /// Check if the fiber's stack may be recycled
    ///
    /// Only `Terminated` fibers go on the free list; `Errored` fibers
    /// are dropped.
    #[inline]
    pub const fn is_reusable(&self) -> bool {
        matches!(self, FiberState::Terminated)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Running,
            3 => FiberState::Suspended,
            4 => FiberState::Terminated,
            5 => FiberState::Errored,
            _ => FiberState::Init,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FiberState::Init => write!(f, "init"),
            FiberState::Ready => write!(f, "ready"),
            FiberState::Running => write!(f, "running"),
            FiberState::Suspended => write!(f, "suspended"),
            FiberState::Terminated => write!(f, "terminated"),
            FiberState::Errored => write!(f, "errored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Ready.is_ready());
        assert!(!FiberState::Running.is_ready());

        assert!(FiberState::Terminated.is_terminal());
        assert!(FiberState::Errored.is_terminal());
        assert!(!FiberState::Suspended.is_terminal());

        assert!(FiberState::Terminated.is_reusable());
        assert!(!FiberState::Errored.is_reusable());
    }

    #[test]
    fn test_state_round_trip() {
        for raw in 0u8..=5 {
            let state = FiberState::from(raw);
            assert_eq!(u8::from(state), raw);
        }
        // Out-of-range values fall back to Init
        assert_eq!(FiberState::from(99), FiberState::Init);
    }
}
