//! The I/O fiber scheduler
//!
//! Composes the job pool, the fiber registry, and a dedicated poller
//! thread. Fiber code suspends by arming interest on an fd and
//! yielding; the poller thread turns OS readiness events into resume
//! jobs on the pool. A fiber may be resumed on a different worker than
//! the one that started it.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use strand_core::error::{SchedError, SchedResult};
use strand_core::id::FiberId;
use strand_core::state::FiberState;

use crate::config::SchedulerConfig;
use crate::fiber::Fiber;
use crate::poller::{Interest, Poller, WAKE_TOKEN};
use crate::pool::JobPool;
use crate::tls;

/// Registry record for one spawned fiber.
struct FiberDesc {
    fiber: Arc<Fiber>,
    /// Awaited event kind; NONE when the fiber is not parked on I/O
    awaited: Interest,
    /// OS handle being awaited, or -1
    fd: RawFd,
}

struct Registry {
    /// Fiber id -> descriptor
    fibers: HashMap<u64, FiberDesc>,
    /// fd -> armed interest union; prevents duplicate OS registration
    io: HashMap<RawFd, Interest>,
    /// Terminated fibers retained for stack reuse
    free: VecDeque<Arc<Fiber>>,
}

struct Shared {
    config: SchedulerConfig,
    pool: JobPool,
    registry: Mutex<Registry>,
    poller: Poller,
    poller_thread: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
    read_arms: AtomicU64,
    write_arms: AtomicU64,
}

/// Cloneable handle to a running scheduler.
///
/// A process-global instance is usually installed once via `install`;
/// independent instances can be constructed directly (tests do).
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

static GLOBAL: OnceLock<Scheduler> = OnceLock::new();

impl Scheduler {
    /// Build a scheduler and start its workers and poller thread.
    pub fn new(config: SchedulerConfig) -> SchedResult<Scheduler> {
        config.validate().map_err(SchedError::InvalidConfig)?;

        let poller = Poller::new()?;
        let pool = JobPool::new(config.thread_count);

        let shared = Arc::new(Shared {
            config,
            pool,
            registry: Mutex::new(Registry {
                fibers: HashMap::new(),
                io: HashMap::new(),
                free: VecDeque::new(),
            }),
            poller,
            poller_thread: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            read_arms: AtomicU64::new(0),
            write_arms: AtomicU64::new(0),
        });

        let for_thread = shared.clone();
        let handle = thread::Builder::new()
            .name("strand-poller".into())
            .spawn(move || poller_loop(for_thread))
            .map_err(SchedError::from)?;
        *shared.poller_thread.lock() = Some(handle);

        Ok(Scheduler { shared })
    }

    /// Install the process-global scheduler.
    pub fn install(config: SchedulerConfig) -> SchedResult<Scheduler> {
        let sched = Scheduler::new(config)?;
        if GLOBAL.set(sched.clone()).is_err() {
            sched.shutdown();
            return Err(SchedError::AlreadyInstalled);
        }
        Ok(sched)
    }

    /// Get the installed global scheduler.
    pub fn current() -> SchedResult<Scheduler> {
        GLOBAL.get().cloned().ok_or(SchedError::NotInstalled)
    }

    /// Get the installed global scheduler, if any.
    pub fn try_current() -> Option<Scheduler> {
        GLOBAL.get().cloned()
    }

    /// Submit a task as a new fiber.
    ///
    /// Recycles a terminated fiber from the free list when one is
    /// available, otherwise allocates a fresh stack. Returns the new
    /// generation's id.
    pub fn spawn<F>(&self, f: F) -> SchedResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(SchedError::PoolStopped);
        }

        let recycled = {
            let mut reg = self.shared.registry.lock();
            match reg.free.pop_front() {
                Some(fiber)
                    if fiber.state() == FiberState::Terminated && !fiber.is_on_cpu() =>
                {
                    Some(fiber)
                }
                Some(fiber) => {
                    // Its final switch has not completed yet; revisit
                    // later rather than re-priming a live stack.
                    reg.free.push_back(fiber);
                    None
                }
                None => None,
            }
        };

        let fiber = match recycled {
            Some(fiber) => {
                fiber.reuse(f)?;
                fiber
            }
            None => Fiber::with_stack_size(f, self.shared.config.stack_size)?,
        };

        // Registry cleanup happens even on paths where the task forgets
        let weak = Arc::downgrade(&self.shared);
        fiber.set_completion(move || {
            if let Some(shared) = weak.upgrade() {
                Shared::exit_fiber(&shared);
            }
        })?;

        let id = fiber.id();
        {
            let mut reg = self.shared.registry.lock();
            reg.fibers.insert(
                id.as_u64(),
                FiberDesc {
                    fiber: fiber.clone(),
                    awaited: Interest::NONE,
                    fd: -1,
                },
            );
        }

        let shared = self.shared.clone();
        if let Err(e) = self
            .shared
            .pool
            .enqueue(move || Shared::run_fiber(&shared, &fiber, true))
        {
            self.shared.registry.lock().fibers.remove(&id.as_u64());
            return Err(e);
        }
        log::debug!("fiber {} spawned", id);
        Ok(id)
    }

    /// Suspend the calling fiber back to its worker thread.
    pub fn yield_current(&self) -> SchedResult<()> {
        let fiber = tls::current().ok_or(SchedError::NotAFiber)?;
        fiber.yield_now()
    }

    /// Declare the calling fiber's interest in event kinds on `fd`.
    ///
    /// The first arm for an fd does an epoll ADD; widening or
    /// re-arming does a MOD (edge-triggered, so a MOD makes a
    /// still-pending condition deliver a fresh edge). An OS failure is
    /// returned and the fiber is not suspended.
    pub fn register_io(&self, fd: RawFd, interest: Interest) -> SchedResult<()> {
        if interest.is_empty() {
            return Ok(());
        }
        let id = tls::current_id();
        if id.is_none() {
            return Err(SchedError::NotAFiber);
        }

        let mut reg = self.shared.registry.lock();
        if !reg.fibers.contains_key(&id.as_u64()) {
            return Err(SchedError::FiberNotFound);
        }

        match reg.io.get(&fd).copied() {
            Some(armed) if armed.contains(interest) => {
                // Kinds already armed: refresh the edge trigger so
                // readiness that arrived since the last wake is
                // re-reported.
                self.shared.poller.modify(fd, armed, id.as_u64())?;
            }
            Some(armed) => {
                let union = armed.union(interest);
                self.shared.poller.modify(fd, union, id.as_u64())?;
                reg.io.insert(fd, union);
            }
            None => {
                self.shared.poller.add(fd, interest, id.as_u64())?;
                reg.io.insert(fd, interest);
            }
        }

        if let Some(desc) = reg.fibers.get_mut(&id.as_u64()) {
            desc.awaited = interest;
            desc.fd = fd;
        }
        if interest.contains(Interest::READ) {
            self.shared.read_arms.fetch_add(1, Ordering::Relaxed);
        }
        if interest.contains(Interest::WRITE) {
            self.shared.write_arms.fetch_add(1, Ordering::Relaxed);
        }
        log::trace!("fiber {} armed {} on fd {}", id, interest, fd);
        Ok(())
    }

    /// Remove `fd` from the I/O registry and the OS poller.
    ///
    /// Called from the socket adapter's destructor; tolerates an fd
    /// the poller no longer knows.
    pub fn unregister_io(&self, fd: RawFd) -> SchedResult<()> {
        let mut reg = self.shared.registry.lock();
        if reg.io.remove(&fd).is_some() {
            if let Err(e) = self.shared.poller.delete(fd) {
                log::debug!("epoll delete for fd {} failed: {}", fd, e);
            }
        }
        Ok(())
    }

    /// Remove the calling fiber from the registry and retain it for
    /// reuse. Installed automatically as every spawned fiber's
    /// completion callback.
    pub fn exit_current(&self) {
        Shared::exit_fiber(&self.shared);
    }

    /// Stop the poller thread and the worker pool, then drop all
    /// registered fibers. Idempotent; bounded by in-flight jobs.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.poller.notify();
        if let Some(handle) = self.shared.poller_thread.lock().take() {
            let _ = handle.join();
        }
        self.shared.pool.stop();
        self.shared.pool.join();

        let mut reg = self.shared.registry.lock();
        reg.fibers.clear();
        reg.io.clear();
        reg.free.clear();
        log::info!("scheduler shut down");
    }

    /// Worker thread count this scheduler was built with
    pub fn thread_count(&self) -> usize {
        self.shared.config.thread_count
    }

    // ── observability (used by the property tests) ──

    /// Whether `id` currently has a registry descriptor
    pub fn is_registered(&self, id: FiberId) -> bool {
        self.shared.registry.lock().fibers.contains_key(&id.as_u64())
    }

    /// Armed interest union for `fd`, if it is in the I/O registry
    pub fn io_armed(&self, fd: RawFd) -> Option<Interest> {
        self.shared.registry.lock().io.get(&fd).copied()
    }

    /// Fibers currently parked on the free list
    pub fn free_fibers(&self) -> usize {
        self.shared.registry.lock().free.len()
    }

    /// Total epoll ADD operations issued
    pub fn poller_adds(&self) -> u64 {
        self.shared.poller.ctl_add_count()
    }

    /// Total READ interest registrations
    pub fn read_arms(&self) -> u64 {
        self.shared.read_arms.load(Ordering::Relaxed)
    }

    /// Total WRITE interest registrations
    pub fn write_arms(&self) -> u64 {
        self.shared.write_arms.load(Ordering::Relaxed)
    }
}

impl Shared {
    /// Start or resume `fiber` on the calling worker thread.
    fn run_fiber(shared: &Arc<Shared>, fiber: &Arc<Fiber>, first: bool) {
        let result = if first { fiber.start() } else { fiber.resume() };
        if let Err(e) = result {
            log::error!("fiber {} dispatch failed: {}", fiber.id(), e);
        }
        if fiber.state() == FiberState::Errored {
            // The completion callback only runs on normal return, so a
            // panicked task's descriptor is cleared here. Errored
            // fibers never join the free list.
            shared.registry.lock().fibers.remove(&fiber.id().as_u64());
        }
    }

    /// Completion-callback body: runs on the exiting fiber's stack.
    fn exit_fiber(shared: &Arc<Shared>) {
        let id = tls::current_id();
        if id.is_none() {
            log::warn!("exit_current called outside a fiber");
            return;
        }
        let mut reg = shared.registry.lock();
        if let Some(desc) = reg.fibers.remove(&id.as_u64()) {
            reg.free.push_back(desc.fiber);
        }
    }
}

/// The dedicated poller thread: blocks on epoll, turns readiness
/// events into resume jobs.
fn poller_loop(shared: Arc<Shared>) {
    let mut events = Vec::new();
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if let Err(e) = shared.poller.wait(&mut events, -1) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // No progress; log and retry
            log::error!("poller wait failed: {}", e);
            thread::sleep(Duration::from_millis(10));
            continue;
        }

        for ev in &events {
            if ev.token == WAKE_TOKEN {
                shared.poller.drain_wake();
                continue;
            }

            let (fiber, fd) = {
                let mut reg = shared.registry.lock();
                let Some(desc) = reg.fibers.get_mut(&ev.token) else {
                    // The fiber exited between the epoll harvest and
                    // this lookup; its fd has already been (or is
                    // about to be) deregistered. Anything else here
                    // would be a registry use-after-free.
                    log::warn!("stale readiness event for fiber {}", ev.token);
                    continue;
                };
                if desc.awaited.is_empty() {
                    // Not parked on I/O; stale edge
                    continue;
                }
                let wanted = !desc.awaited.intersect(ev.ready).is_empty();
                if !wanted && !ev.closed {
                    // Ready kind does not match the awaited kind;
                    // error/hangup always wakes
                    continue;
                }
                desc.awaited = Interest::NONE;
                (desc.fiber.clone(), desc.fd)
            };

            log::trace!("fiber {} woken on fd {}", fiber.id(), fd);
            let for_job = shared.clone();
            if let Err(e) = shared
                .pool
                .enqueue(move || Shared::run_fiber(&for_job, &fiber, false))
            {
                log::warn!("dropping wake during shutdown: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn small_config(threads: usize) -> SchedulerConfig {
        SchedulerConfig::new()
            .thread_count(threads)
            .stack_size(64 * 1024)
    }

    fn wait_until(mut cond: impl FnMut() -> bool, ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = Scheduler::new(SchedulerConfig::new().thread_count(0)).unwrap_err();
        assert!(matches!(err, SchedError::InvalidConfig(_)));
    }

    #[test]
    fn test_spawn_runs_task() {
        let sched = Scheduler::new(small_config(2)).unwrap();
        let (tx, rx) = mpsc::channel();
        sched.spawn(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
        sched.shutdown();
    }

    #[test]
    fn test_spawn_ids_are_distinct() {
        let sched = Scheduler::new(small_config(2)).unwrap();
        let mut ids = Vec::new();
        for _ in 0..32 {
            let (tx, rx) = mpsc::channel();
            let id = sched.spawn(move || tx.send(()).unwrap()).unwrap();
            ids.push(id);
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
        }
        // Sequential spawns reuse stacks from the free list, yet every
        // generation gets its own id
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
        sched.shutdown();
    }

    #[test]
    fn test_registry_consistency() {
        let sched = Scheduler::new(small_config(2)).unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        let id = sched
            .spawn(move || {
                started_tx.send(()).unwrap();
                // Parks the worker, not the scheduler; fine in a test
                let _ = gate_rx.recv();
            })
            .unwrap();

        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(sched.is_registered(id));

        gate_tx.send(()).unwrap();
        assert!(wait_until(|| !sched.is_registered(id), 2000));
        assert!(wait_until(|| sched.free_fibers() > 0, 2000));
        sched.shutdown();
    }

    #[test]
    fn test_free_list_reuse_observes_new_task() {
        let sched = Scheduler::new(small_config(1)).unwrap();
        let (tx1, rx1) = mpsc::channel();
        sched.spawn(move || tx1.send("first").unwrap()).unwrap();
        assert_eq!(rx1.recv_timeout(Duration::from_secs(2)).unwrap(), "first");
        assert!(wait_until(|| sched.free_fibers() > 0, 2000));

        let (tx2, rx2) = mpsc::channel();
        sched.spawn(move || tx2.send("second").unwrap()).unwrap();
        assert_eq!(rx2.recv_timeout(Duration::from_secs(2)).unwrap(), "second");
        sched.shutdown();
    }

    #[test]
    fn test_panicked_task_is_cleaned_up() {
        let sched = Scheduler::new(small_config(2)).unwrap();
        let id = sched.spawn(|| panic!("task blew up")).unwrap();
        assert!(wait_until(|| !sched.is_registered(id), 2000));
        // Errored fibers are not recycled
        assert_eq!(sched.free_fibers(), 0);
        sched.shutdown();
    }

    #[test]
    fn test_reregistration_adds_to_poller_once() {
        let sched = Scheduler::new(small_config(1)).unwrap();
        let (done_tx, done_rx) = mpsc::channel();

        let fiber_sched = sched.clone();
        sched
            .spawn(move || {
                let mut fds = [0i32; 2];
                let ret = unsafe {
                    libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC)
                };
                assert_eq!(ret, 0);
                fiber_sched.register_io(fds[0], Interest::READ).unwrap();
                fiber_sched.register_io(fds[0], Interest::READ).unwrap();
                let adds = fiber_sched.poller_adds();
                fiber_sched.unregister_io(fds[0]).unwrap();
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                done_tx.send(adds).unwrap();
            })
            .unwrap();

        let adds = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(adds, 1);
        sched.shutdown();
    }

    #[test]
    fn test_yield_current_off_fiber_fails() {
        let sched = Scheduler::new(small_config(1)).unwrap();
        assert_eq!(sched.yield_current(), Err(SchedError::NotAFiber));
        sched.shutdown();
    }

    #[test]
    fn test_register_io_off_fiber_fails() {
        let sched = Scheduler::new(small_config(1)).unwrap();
        assert_eq!(
            sched.register_io(0, Interest::READ),
            Err(SchedError::NotAFiber)
        );
        sched.shutdown();
    }

    #[test]
    fn test_spawn_after_shutdown_fails() {
        let sched = Scheduler::new(small_config(1)).unwrap();
        sched.shutdown();
        assert_eq!(sched.spawn(|| {}).unwrap_err(), SchedError::PoolStopped);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_bounded() {
        let sched = Scheduler::new(small_config(2)).unwrap();
        let start = Instant::now();
        sched.shutdown();
        sched.shutdown();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
