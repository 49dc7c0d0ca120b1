//! epoll readiness poller
//!
//! Thin wrapper over `epoll_create1`/`epoll_ctl`/`epoll_wait` plus an
//! eventfd used to interrupt a blocked wait. All fd registrations are
//! edge-triggered; the scheduler re-arms interest after every wake.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

/// Token reserved for the internal wakeup eventfd
pub const WAKE_TOKEN: u64 = u64::MAX;

/// Bitset of awaitable event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);

    /// Union of both kinds
    #[inline]
    pub const fn union(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// Intersection of both kinds
    #[inline]
    pub const fn intersect(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }

    /// True when every kind in `other` is present in `self`
    #[inline]
    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        self.union(rhs)
    }
}

impl std::fmt::Display for Interest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.contains(Interest::READ), self.contains(Interest::WRITE)) {
            (true, true) => write!(f, "rw"),
            (true, false) => write!(f, "r"),
            (false, true) => write!(f, "w"),
            (false, false) => write!(f, "-"),
        }
    }
}

/// One readiness event out of `wait`.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// Userdata supplied at arm time (a fiber id, or `WAKE_TOKEN`)
    pub token: u64,
    /// Ready kinds
    pub ready: Interest,
    /// Error or hangup was reported; always wakes the waiter
    pub closed: bool,
}

/// The epoll instance plus its wakeup eventfd.
pub struct Poller {
    epfd: RawFd,
    wake_fd: RawFd,
    ctl_adds: AtomicU64,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(epfd);
            }
            return Err(err);
        }

        // The wake fd is level-triggered on purpose: a pending wake
        // stays visible until drained.
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        let ret = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epfd);
            }
            return Err(err);
        }

        Ok(Poller {
            epfd,
            wake_fd,
            ctl_adds: AtomicU64::new(0),
        })
    }

    /// Arm a new fd. Edge-triggered.
    pub fn add(&self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: event_mask(interest),
            u64: token,
        };
        cvt(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) })?;
        self.ctl_adds.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Re-arm an fd already in the set, widening or refreshing its
    /// interest. With edge triggering a still-pending condition is
    /// reported again after a MOD.
    pub fn modify(&self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: event_mask(interest),
            u64: token,
        };
        cvt(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) })?;
        Ok(())
    }

    /// Remove an fd from the set.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        cvt(unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) })?;
        Ok(())
    }

    /// Block for ready events. `timeout_ms` of -1 blocks indefinitely.
    pub fn wait(&self, out: &mut Vec<Event>, timeout_ms: i32) -> io::Result<usize> {
        let mut raw: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
        let n = cvt(unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), raw.len() as i32, timeout_ms)
        })?;

        out.clear();
        for ev in raw.iter().take(n as usize) {
            let mut ready = Interest::NONE;
            if (ev.events & libc::EPOLLIN as u32) != 0 {
                ready = ready | Interest::READ;
            }
            if (ev.events & libc::EPOLLOUT as u32) != 0 {
                ready = ready | Interest::WRITE;
            }
            let closed = (ev.events
                & (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32)
                != 0;
            out.push(Event {
                token: ev.u64,
                ready,
                closed,
            });
        }
        Ok(n as usize)
    }

    /// Interrupt a blocked `wait`.
    pub fn notify(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    /// Consume a pending wakeup so the level-triggered wake fd goes
    /// quiet again.
    pub fn drain_wake(&self) {
        let mut buf: u64 = 0;
        unsafe {
            libc::read(self.wake_fd, &mut buf as *mut u64 as *mut libc::c_void, 8);
        }
    }

    /// Number of `EPOLL_CTL_ADD` calls issued for user fds
    pub fn ctl_add_count(&self) -> u64 {
        self.ctl_adds.load(Ordering::Relaxed)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epfd);
        }
    }
}

fn event_mask(interest: Interest) -> u32 {
    let mut mask = (libc::EPOLLET | libc::EPOLLRDHUP) as u32;
    if interest.contains(Interest::READ) {
        mask |= libc::EPOLLIN as u32;
    }
    if interest.contains(Interest::WRITE) {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

fn cvt(ret: i32) -> io::Result<i32> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_interest_bitset() {
        let rw = Interest::READ | Interest::WRITE;
        assert!(rw.contains(Interest::READ));
        assert!(rw.contains(Interest::WRITE));
        assert!(!Interest::READ.contains(Interest::WRITE));
        assert!(Interest::NONE.is_empty());
        assert!(!Interest::READ.intersect(rw).is_empty());
        assert_eq!(format!("{}", rw), "rw");
    }

    #[test]
    fn test_pipe_readiness() {
        let poller = Poller::new().unwrap();
        let (rd, wr) = pipe();
        poller.add(rd, Interest::READ, 7).unwrap();
        assert_eq!(poller.ctl_add_count(), 1);

        let payload = [1u8; 4];
        unsafe {
            libc::write(wr, payload.as_ptr() as *const libc::c_void, 4);
        }

        let mut events = Vec::new();
        poller.wait(&mut events, 1000).unwrap();
        let ev = events.iter().find(|e| e.token == 7).expect("no event");
        assert!(ev.ready.contains(Interest::READ));

        poller.delete(rd).unwrap();
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn test_notify_interrupts_wait() {
        let poller = Poller::new().unwrap();
        poller.notify();
        let mut events = Vec::new();
        poller.wait(&mut events, 1000).unwrap();
        assert!(events.iter().any(|e| e.token == WAKE_TOKEN));
        poller.drain_wake();
    }

    #[test]
    fn test_modify_rearms_pending_condition() {
        let poller = Poller::new().unwrap();
        let (rd, wr) = pipe();
        poller.add(rd, Interest::READ, 9).unwrap();

        let payload = [1u8; 4];
        unsafe {
            libc::write(wr, payload.as_ptr() as *const libc::c_void, 4);
        }
        let mut events = Vec::new();
        poller.wait(&mut events, 1000).unwrap();
        assert!(events.iter().any(|e| e.token == 9));

        // Edge consumed; a MOD re-arms the still-readable fd
        poller.modify(rd, Interest::READ, 9).unwrap();
        poller.wait(&mut events, 1000).unwrap();
        assert!(events.iter().any(|e| e.token == 9));
        assert_eq!(poller.ctl_add_count(), 1);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }
}
