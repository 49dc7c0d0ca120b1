//! Thread-local fiber context
//!
//! Each worker thread keeps a pointer to the fiber it is currently
//! running and a thread-root context representing its native stack.
//! The thread-root is the target of a yield from a user fiber; a fiber
//! resumed on a different worker swaps against that worker's root.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::sync::Arc;

use strand_core::context::Context;
use strand_core::id::FiberId;

use crate::fiber::Fiber;

thread_local! {
    /// Fiber currently executing on this thread, if any
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Id mirror of CURRENT_FIBER, readable without touching the Arc
    static CURRENT_ID: Cell<FiberId> = const { Cell::new(FiberId::NONE) };

    /// Saved native-stack context of this thread
    static ROOT_CONTEXT: UnsafeCell<Context> = const { UnsafeCell::new(Context::zeroed()) };
}

/// Install `fiber` as the current fiber of this thread
pub fn set_current(fiber: Arc<Fiber>) {
    CURRENT_ID.with(|cell| cell.set(fiber.id()));
    CURRENT_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber));
}

/// Clear the current fiber (worker going back to its native stack)
pub fn clear_current() {
    CURRENT_ID.with(|cell| cell.set(FiberId::NONE));
    CURRENT_FIBER.with(|cell| *cell.borrow_mut() = None);
}

/// Get the current fiber, if this thread is running one
pub fn current() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|cell| cell.borrow().clone())
}

/// Get the current fiber's id without cloning the Arc
#[inline]
pub fn current_id() -> FiberId {
    CURRENT_ID.with(|cell| cell.get())
}

/// Check if this thread is currently inside a fiber
#[inline]
pub fn is_fiber() -> bool {
    current_id().is_some()
}

/// Raw pointer to the current fiber's saved context.
///
/// Used by the final switch out of a terminating fiber, where cloning
/// the Arc would leak a reference across a switch that never returns.
pub(crate) fn current_context_ptr() -> Option<*mut Context> {
    CURRENT_FIBER.with(|cell| cell.borrow().as_ref().map(|f| f.context_ptr()))
}

/// Pointer to this thread's root context.
///
/// Valid for the lifetime of the thread; only ever passed to the
/// context-switch primitive from the owning thread.
pub(crate) fn root_context_ptr() -> *mut Context {
    ROOT_CONTEXT.with(|cell| cell.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_current_fiber_by_default() {
        assert!(!is_fiber());
        assert!(current().is_none());
        assert_eq!(current_id(), FiberId::NONE);
    }

    #[test]
    fn test_root_context_is_stable() {
        let a = root_context_ptr();
        let b = root_context_ptr();
        assert_eq!(a, b);
    }
}
