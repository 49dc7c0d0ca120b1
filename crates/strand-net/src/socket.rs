//! Non-blocking socket adapter
//!
//! Wraps one OS socket in non-blocking mode. Operations are written as
//! blocking-style loops: syscall, and on `EAGAIN` register interest
//! with the scheduler and yield the worker thread, retrying after the
//! poller wakes the fiber. Off-fiber (or with no scheduler attached)
//! the `WouldBlock` error surfaces to the caller instead.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use strand_core::error::SchedError;
use strand_runtime::poller::Interest;
use strand_runtime::tls;
use strand_runtime::Scheduler;

use crate::addr;

/// Transport kind of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Tcp,
    Udp,
    Unix,
}

/// A non-blocking socket bound to the fiber scheduler.
///
/// The underlying fd is owned exclusively by this value and closed
/// exactly once, in `Drop` (after deregistering from the poller).
pub struct Socket {
    fd: RawFd,
    kind: SocketKind,
    domain: libc::c_int,
    /// Bound address for created sockets; peer address for accepted
    /// or connected ones
    addr: String,
    port: u16,
    sched: Option<Scheduler>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd)
            .field("kind", &self.kind)
            .field("domain", &self.domain)
            .field("addr", &self.addr)
            .field("port", &self.port)
            .finish()
    }
}

impl Socket {
    /// Create a non-blocking socket and bind it, attaching the
    /// installed global scheduler if one exists.
    pub fn create(kind: SocketKind, addr: &str, port: u16) -> io::Result<Socket> {
        Socket::create_in(Scheduler::try_current(), kind, addr, port)
    }

    /// Create a non-blocking socket bound to `addr`:`port`, suspending
    /// on the given scheduler (or surfacing `WouldBlock` if `None`).
    pub fn create_in(
        sched: Option<Scheduler>,
        kind: SocketKind,
        addr: &str,
        port: u16,
    ) -> io::Result<Socket> {
        let domain = addr::domain_of(addr);
        let socktype = match kind {
            SocketKind::Tcp | SocketKind::Unix => libc::SOCK_STREAM,
            SocketKind::Udp => libc::SOCK_DGRAM,
        };

        let fd = unsafe {
            libc::socket(
                domain,
                socktype | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            log::error!("socket create failed: {}", err);
            return Err(err);
        }

        let socket = Socket {
            fd,
            kind,
            domain,
            addr: addr.to_string(),
            port,
            sched,
        };
        socket.bind(addr, port)?;
        Ok(socket)
    }

    /// Bind to an address. Synchronous; fails on syscall error.
    pub fn bind(&self, addr: &str, port: u16) -> io::Result<()> {
        let (ss, len) = addr::resolve(addr, port)?;
        let ret = unsafe {
            libc::bind(self.fd, &ss as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            let err = io::Error::last_os_error();
            log::error!("bind {}:{} failed: {}", addr, port, err);
            return Err(err);
        }
        Ok(())
    }

    /// Start listening. Stream sockets only.
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        if self.kind == SocketKind::Udp {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "listen() requires a stream socket",
            ));
        }
        let ret = unsafe { libc::listen(self.fd, backlog) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            log::error!("listen failed: {}", err);
            return Err(err);
        }
        Ok(())
    }

    /// Accept one connection, suspending the calling fiber until a
    /// client arrives. The returned socket inherits this socket's
    /// scheduler and carries the peer address.
    pub fn accept(&self) -> io::Result<Socket> {
        if self.kind == SocketKind::Udp {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "accept() requires a stream socket",
            ));
        }
        loop {
            let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let ret = unsafe {
                libc::accept4(
                    self.fd,
                    &mut ss as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if ret >= 0 {
                let (peer, peer_port) = addr::peer_of(&ss);
                log::debug!("accepted connection from {}:{}", peer, peer_port);
                return Ok(Socket {
                    fd: ret,
                    kind: self.kind,
                    domain: self.domain,
                    addr: peer,
                    port: peer_port,
                    sched: self.sched.clone(),
                });
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                    self.suspend(Interest::READ, err)?;
                }
                _ => {
                    log::error!("accept failed: {}", err);
                    return Err(err);
                }
            }
        }
    }

    /// Connect to a remote address, suspending until the handshake
    /// settles. On success the socket's address becomes the peer's.
    pub fn connect(&mut self, addr: &str, port: u16) -> io::Result<()> {
        let (ss, len) = addr::resolve(addr, port)?;
        let ret = unsafe {
            libc::connect(self.fd, &ss as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::EINPROGRESS => {
                    self.suspend(Interest::WRITE, err)?;
                    // Writable now; the result is in SO_ERROR
                    let mut so_err: libc::c_int = 0;
                    let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
                    let ret = unsafe {
                        libc::getsockopt(
                            self.fd,
                            libc::SOL_SOCKET,
                            libc::SO_ERROR,
                            &mut so_err as *mut _ as *mut libc::c_void,
                            &mut optlen,
                        )
                    };
                    if ret != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if so_err != 0 {
                        return Err(io::Error::from_raw_os_error(so_err));
                    }
                }
                _ => {
                    log::error!("connect {}:{} failed: {}", addr, port, err);
                    return Err(err);
                }
            }
        }
        self.addr = addr.to_string();
        self.port = port;
        Ok(())
    }

    /// Read into `buf`, suspending until at least one byte (or EOF)
    /// is available. `Ok(0)` means the peer closed the connection.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                    self.suspend(Interest::READ, err)?;
                }
                _ => {
                    log::error!("fiber {} socket read failed: {}", tls::current_id(), err);
                    return Err(err);
                }
            }
        }
    }

    /// Write all of `buf`, suspending on backpressure until every byte
    /// is delivered to the kernel.
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut remaining = buf;
        while !remaining.is_empty() {
            let n = unsafe {
                libc::write(
                    self.fd,
                    remaining.as_ptr() as *const libc::c_void,
                    remaining.len(),
                )
            };
            if n > 0 {
                remaining = &remaining[n as usize..];
                continue;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                    self.suspend(Interest::WRITE, err)?;
                }
                _ => {
                    log::error!("fiber {} socket write failed: {}", tls::current_id(), err);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Allow rebinding a recently used local address
    pub fn set_reuseaddr(&self, on: bool) -> io::Result<()> {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on as libc::c_int)
    }

    /// Disable Nagle's algorithm. TCP only; a no-op otherwise.
    pub fn set_tcp_nodelay(&self, on: bool) -> io::Result<()> {
        if self.kind != SocketKind::Tcp {
            return Ok(());
        }
        self.setsockopt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on as libc::c_int)
    }

    /// Locally bound address and port
    pub fn local_addr(&self) -> io::Result<(String, u16)> {
        let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(self.fd, &mut ss as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(addr::peer_of(&ss))
    }

    /// The raw fd
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Scheduler this socket suspends on, if any
    #[inline]
    pub(crate) fn scheduler(&self) -> Option<&Scheduler> {
        self.sched.as_ref()
    }

    /// Transport kind
    #[inline]
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// Address string (bound address, or the peer for accepted and
    /// connected sockets)
    #[inline]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Arm `interest` and yield, or surface `would_block` when no
    /// scheduler applies to the calling context.
    fn suspend(&self, interest: Interest, would_block: io::Error) -> io::Result<()> {
        match &self.sched {
            Some(sched) if tls::is_fiber() => {
                sched.register_io(self.fd, interest).map_err(sched_err)?;
                sched.yield_current().map_err(sched_err)?;
                Ok(())
            }
            _ => Err(would_block),
        }
    }

    fn setsockopt(&self, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                &value as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(sched) = &self.sched {
            let _ = sched.unregister_io(self.fd);
        }
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn sched_err(e: SchedError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}
