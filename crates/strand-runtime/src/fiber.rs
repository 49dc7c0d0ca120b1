//! The stackful fiber task value
//!
//! A `Fiber` binds a user task to a private stack and a saved machine
//! context. It is shared (`Arc`) between the submitter, the scheduler
//! registry, and whichever worker thread is currently running it; the
//! value lives as long as its longest holder.
//!
//! Suspend/resume synchronization: a fiber that yields is only marked
//! `Suspended` on the thread-root side, after the switch has finished
//! saving its registers. A wake racing that switch (the poller can see
//! readiness the instant interest is armed) briefly observes `Running`
//! and spins until the suspend is published.

use std::any::Any;
use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use strand_core::constants::DEFAULT_STACK_SIZE;
use strand_core::context::Context;
use strand_core::error::{SchedError, SchedResult};
use strand_core::id::FiberId;
use strand_core::state::FiberState;

use crate::current_arch;
use crate::stack::FiberStack;
use crate::tls;

/// A bound, zero-argument task
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Global id counter; ids are never reused, including across `reuse`
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// How long `resume` will wait out a suspending switch on another
/// worker before giving up. The save is a few dozen instructions, so
/// hitting this bound means the caller resumed a genuinely running
/// fiber.
const MAX_RESUME_SPINS: u32 = 1 << 20;

/// A stackful cooperative task.
pub struct Fiber {
    /// Current generation's id; rewritten by `reuse`
    id: AtomicU64,
    state: AtomicU8,
    /// True from switch-in until the switch back out has fully saved
    /// this fiber's registers. A fiber can report `Terminated` a few
    /// instructions before its final switch completes; this flag keeps
    /// the stack from being re-primed under it.
    on_cpu: AtomicBool,
    stack: FiberStack,
    ctx: UnsafeCell<Context>,
    task: Mutex<Option<Task>>,
    completion: Mutex<Option<Task>>,
    error: Mutex<Option<String>>,
}

// The context cell is only touched by the thread currently switching
// this fiber in or out; the state machine serializes those.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber bound to `task` with the default 1 MiB stack.
    ///
    /// The fiber is `Ready`; execution does not begin until `start`.
    pub fn create<F>(task: F) -> SchedResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Fiber::with_stack_size(task, DEFAULT_STACK_SIZE)
    }

    /// Create a fiber with an explicit stack size.
    pub fn with_stack_size<F>(task: F, stack_size: usize) -> SchedResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = FiberStack::allocate(stack_size)?;
        let fiber = Arc::new(Fiber {
            id: AtomicU64::new(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed)),
            state: AtomicU8::new(FiberState::Init as u8),
            on_cpu: AtomicBool::new(false),
            stack,
            ctx: UnsafeCell::new(Context::zeroed()),
            task: Mutex::new(Some(Box::new(task))),
            completion: Mutex::new(None),
            error: Mutex::new(None),
        });
        fiber.prime();
        Ok(fiber)
    }

    /// Current generation id
    #[inline]
    pub fn id(&self) -> FiberId {
        FiberId::new(self.id.load(Ordering::Acquire))
    }

    /// Current lifecycle state
    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    /// Panic payload recorded by the mainline, if the task errored
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Record a callable to run on this fiber's stack after the task
    /// returns normally. At most one per generation.
    pub fn set_completion<F>(&self, f: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.completion.lock();
        if slot.is_some() {
            return Err(SchedError::CompletionAlreadySet);
        }
        *slot = Some(Box::new(f));
        Ok(())
    }

    /// Begin execution. Valid only from `Ready`.
    ///
    /// Swaps from the calling thread's root context into the fiber;
    /// returns when the fiber next yields or reaches a terminal state.
    pub fn start(self: &Arc<Self>) -> SchedResult<()> {
        self.transition(FiberState::Ready, FiberState::Running)?;
        self.switch_in();
        Ok(())
    }

    /// Continue a suspended fiber. Valid only from `Suspended`.
    ///
    /// May be called from a different thread than the one that last ran
    /// the fiber; the fiber's stack is self-contained.
    pub fn resume(self: &Arc<Self>) -> SchedResult<()> {
        let mut spins = 0u32;
        loop {
            match self.transition(FiberState::Suspended, FiberState::Running) {
                Ok(()) => break,
                Err(SchedError::InvalidState(FiberState::Running))
                    if spins < MAX_RESUME_SPINS =>
                {
                    // The suspending switch on another worker has not
                    // finished saving registers yet.
                    spins += 1;
                    if spins % 64 == 0 {
                        std::thread::yield_now();
                    } else {
                        std::hint::spin_loop();
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.switch_in();
        Ok(())
    }

    /// Suspend the calling fiber back to its worker's root context.
    ///
    /// Valid only from inside the fiber itself while `Running`.
    pub fn yield_now(&self) -> SchedResult<()> {
        if tls::current_id() != self.id() {
            return Err(SchedError::NotAFiber);
        }
        let state = self.state();
        if state != FiberState::Running {
            return Err(SchedError::InvalidState(state));
        }
        // State stays Running across the switch; switch_in publishes
        // Suspended once the register save is complete.
        let root = tls::root_context_ptr();
        unsafe {
            current_arch::context_switch(self.ctx.get(), root);
        }
        Ok(())
    }

    /// Suspend the calling fiber and hand its worker directly to
    /// `next`, bypassing the root context.
    pub fn yield_to(&self, next: &Arc<Fiber>) -> SchedResult<()> {
        if tls::current_id() != self.id() {
            return Err(SchedError::NotAFiber);
        }
        let state = self.state();
        if state != FiberState::Running {
            return Err(SchedError::InvalidState(state));
        }
        if next.transition(FiberState::Suspended, FiberState::Running).is_err() {
            next.transition(FiberState::Ready, FiberState::Running)?;
        }
        // Direct handoff: nothing can legally resume this fiber until
        // `next` yields, so publishing Suspended before the save is
        // safe here.
        self.set_state(FiberState::Suspended);
        self.on_cpu.store(false, Ordering::Release);
        next.on_cpu.store(true, Ordering::Release);
        tls::set_current(next.clone());
        unsafe {
            current_arch::context_switch(self.ctx.get(), next.ctx.get());
        }
        Ok(())
    }

    /// Rebind a terminated fiber to a new task on the same stack.
    ///
    /// The recycled fiber is a fresh logical task: it gets a new id and
    /// a re-primed first-entry context. Valid only from `Terminated`.
    pub fn reuse<F>(self: &Arc<Self>, task: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.state();
        if state != FiberState::Terminated {
            return Err(SchedError::InvalidState(state));
        }
        *self.task.lock() = Some(Box::new(task));
        *self.completion.lock() = None;
        *self.error.lock() = None;
        self.id
            .store(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed), Ordering::Release);
        self.prime();
        Ok(())
    }

    /// Prime the saved context so the next switch-in enters the
    /// trampoline, and mark the fiber Ready.
    fn prime(self: &Arc<Self>) {
        unsafe {
            current_arch::init_context(
                self.ctx.get(),
                self.stack.top(),
                fiber_main as usize,
                Arc::as_ptr(self) as usize,
            );
        }
        self.set_state(FiberState::Ready);
    }

    /// Swap this thread's root context out for the fiber.
    fn switch_in(self: &Arc<Self>) {
        tls::set_current(self.clone());
        self.on_cpu.store(true, Ordering::Release);
        let root = tls::root_context_ptr();
        unsafe {
            current_arch::context_switch(root, self.ctx.get());
        }
        // Back on the native stack. The fiber that last ran on this
        // thread (`self`, or a yield_to target) has fully saved its
        // registers, so its suspend can be published and its stack
        // released for reuse. Terminal states were already set by the
        // mainline.
        if let Some(last) = tls::current() {
            if last.state() == FiberState::Running {
                last.set_state(FiberState::Suspended);
            }
            last.on_cpu.store(false, Ordering::Release);
        }
        tls::clear_current();
    }

    #[inline]
    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: FiberState, to: FiberState) -> SchedResult<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| SchedError::InvalidState(FiberState::from(actual)))
    }

    fn record_error(&self, payload: Box<dyn Any + Send>) {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "fiber task panicked".to_string()
        };
        log::error!("fiber {} failed: {}", self.id(), msg);
        *self.error.lock() = Some(msg);
        self.set_state(FiberState::Errored);
    }

    /// Whether a worker is still between switch-in and switch-out for
    /// this fiber. The free-list pop refuses fibers still on a CPU.
    #[inline]
    pub(crate) fn is_on_cpu(&self) -> bool {
        self.on_cpu.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn context_ptr(&self) -> *mut Context {
        self.ctx.get()
    }
}

/// Fiber mainline, the trampoline's entry function.
///
/// Runs the user task, then the completion callback; a panic in either
/// is caught here rather than unwinding through the context switch.
extern "C" fn fiber_main(arg: usize) {
    let fiber = unsafe { &*(arg as *const Fiber) };

    let task = fiber.task.lock().take();
    match catch_unwind(AssertUnwindSafe(|| {
        if let Some(task) = task {
            task();
        }
    })) {
        Ok(()) => {
            let completion = fiber.completion.lock().take();
            match catch_unwind(AssertUnwindSafe(|| {
                if let Some(completion) = completion {
                    completion();
                }
            })) {
                Ok(()) => fiber.set_state(FiberState::Terminated),
                Err(payload) => fiber.record_error(payload),
            }
        }
        Err(payload) => fiber.record_error(payload),
    }
    // Returning re-enters the trampoline, which calls fiber_finished.
}

/// Final switch out of a terminating fiber, called by the trampoline
/// after `fiber_main` returns.
pub(crate) extern "C" fn fiber_finished() {
    let Some(ctx) = tls::current_context_ptr() else {
        // No current fiber: the bookkeeping this stack needs to return
        // anywhere is gone.
        std::process::abort();
    };
    let root = tls::root_context_ptr();
    unsafe {
        current_arch::context_switch(ctx, root);
    }
    unreachable!("terminated fiber was switched back in");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let log = log.clone();
            move |s: &str| log.lock().push(s.to_string())
        };
        (log, sink)
    }

    #[test]
    fn test_yield_round_trip() {
        let (log, sink) = recorder();
        let fiber = Fiber::create(move || {
            sink("A");
            tls::current().unwrap().yield_now().unwrap();
            sink("B");
        })
        .unwrap();

        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.start().unwrap();
        assert_eq!(fiber.state(), FiberState::Suspended);
        assert_eq!(*log.lock(), vec!["A"]);

        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Terminated);
        assert_eq!(*log.lock(), vec!["A", "B"]);
    }

    #[test]
    fn test_two_fiber_interleave() {
        let (log, sink) = recorder();
        let make = |tag: &'static str| {
            let sink = sink.clone();
            Fiber::create(move || {
                for _ in 0..3 {
                    sink(tag);
                    tls::current().unwrap().yield_now().unwrap();
                }
            })
            .unwrap()
        };
        let f1 = make("1");
        let f2 = make("2");

        f1.start().unwrap();
        f2.start().unwrap();
        while !f1.state().is_terminal() || !f2.state().is_terminal() {
            if f1.state() == FiberState::Suspended {
                f1.resume().unwrap();
            }
            if f2.state() == FiberState::Suspended {
                f2.resume().unwrap();
            }
        }
        assert_eq!(*log.lock(), vec!["1", "2", "1", "2", "1", "2"]);
    }

    #[test]
    fn test_completion_runs_after_task() {
        let (log, sink) = recorder();
        let task_sink = sink.clone();
        let fiber = Fiber::create(move || task_sink("task")).unwrap();
        let done_sink = sink.clone();
        fiber.set_completion(move || done_sink("done")).unwrap();

        fiber.start().unwrap();
        assert_eq!(fiber.state(), FiberState::Terminated);
        assert_eq!(*log.lock(), vec!["task", "done"]);
    }

    #[test]
    fn test_completion_set_twice_fails() {
        let fiber = Fiber::create(|| {}).unwrap();
        fiber.set_completion(|| {}).unwrap();
        assert_eq!(
            fiber.set_completion(|| {}),
            Err(SchedError::CompletionAlreadySet)
        );
    }

    #[test]
    fn test_panic_is_captured() {
        let fiber = Fiber::create(|| panic!("boom")).unwrap();
        fiber.start().unwrap();
        assert_eq!(fiber.state(), FiberState::Errored);
        assert!(fiber.error().unwrap().contains("boom"));
    }

    #[test]
    fn test_start_from_wrong_state_fails() {
        let fiber = Fiber::create(|| {
            tls::current().unwrap().yield_now().unwrap();
        })
        .unwrap();
        fiber.start().unwrap();
        // Suspended now; starting again is a protocol error
        assert!(matches!(
            fiber.start(),
            Err(SchedError::InvalidState(FiberState::Suspended))
        ));
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Terminated);
    }

    #[test]
    fn test_reuse_fresh_generation() {
        let (log, sink) = recorder();
        let first = sink.clone();
        let fiber = Fiber::create(move || first("first")).unwrap();
        let old_id = fiber.id();
        fiber.start().unwrap();
        assert_eq!(fiber.state(), FiberState::Terminated);

        let second = sink.clone();
        fiber.reuse(move || second("second")).unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_ne!(fiber.id(), old_id);

        fiber.start().unwrap();
        assert_eq!(fiber.state(), FiberState::Terminated);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_reuse_requires_terminated() {
        let fiber = Fiber::create(|| {}).unwrap();
        assert!(matches!(
            fiber.reuse(|| {}),
            Err(SchedError::InvalidState(FiberState::Ready))
        ));
    }

    #[test]
    fn test_yield_to_handoff() {
        let (log, sink) = recorder();
        let b_sink = sink.clone();
        let f2 = Fiber::create(move || b_sink("b")).unwrap();

        let a_sink = sink.clone();
        let target = f2.clone();
        let f1 = Fiber::create(move || {
            a_sink("a");
            let me = tls::current().unwrap();
            me.yield_to(&target).unwrap();
            a_sink("c");
        })
        .unwrap();

        f1.start().unwrap();
        assert_eq!(f2.state(), FiberState::Terminated);
        assert_eq!(f1.state(), FiberState::Suspended);
        f1.resume().unwrap();
        assert_eq!(f1.state(), FiberState::Terminated);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_distinct_ids() {
        let a = Fiber::create(|| {}).unwrap();
        let b = Fiber::create(|| {}).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(b.id() > a.id() || a.id() > b.id());
    }
}
