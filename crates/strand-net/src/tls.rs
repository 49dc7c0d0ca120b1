//! TLS socket variant
//!
//! Structurally identical to the plain adapter: every OpenSSL
//! `WANT_READ`/`WANT_WRITE` maps to the same register-interest-and-
//! yield step. The handshake runs inside `accept`, waiting on the
//! accepted connection's fd.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use openssl::ssl::{
    ErrorCode, HandshakeError, Ssl, SslAcceptor, SslFiletype, SslMethod, SslStream,
};

use strand_runtime::poller::Interest;
use strand_runtime::tls as fiber_tls;
use strand_runtime::Scheduler;

use crate::socket::{Socket, SocketKind};

/// Raw fd transport handed to OpenSSL.
///
/// Performs plain non-blocking syscalls and reports `WouldBlock`
/// without suspending; the outer TLS loops own the suspend decision.
struct FdStream {
    fd: RawFd,
}

impl Read for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl Write for FdStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len())
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A listening socket that answers with a TLS handshake.
pub struct TlsListener {
    listener: Socket,
    acceptor: SslAcceptor,
}

impl TlsListener {
    /// Bind a TLS listener with the given PEM certificate and key.
    pub fn bind(
        sched: Option<Scheduler>,
        addr: &str,
        port: u16,
        cert_path: &str,
        key_path: &str,
    ) -> io::Result<TlsListener> {
        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())
            .map_err(ssl_err)?;
        builder
            .set_certificate_chain_file(cert_path)
            .map_err(ssl_err)?;
        builder
            .set_private_key_file(key_path, SslFiletype::PEM)
            .map_err(ssl_err)?;
        builder.check_private_key().map_err(ssl_err)?;

        let listener = Socket::create_in(sched, SocketKind::Tcp, addr, port)?;
        listener.set_reuseaddr(true)?;
        Ok(TlsListener {
            listener,
            acceptor: builder.build(),
        })
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.listener.listen(backlog)
    }

    pub fn local_addr(&self) -> io::Result<(String, u16)> {
        self.listener.local_addr()
    }

    /// Accept a connection and complete the TLS handshake.
    ///
    /// The TCP accept suspends on the listener fd; the handshake loop
    /// suspends on the accepted connection's fd.
    pub fn accept(&self) -> io::Result<TlsSocket> {
        let conn = self.listener.accept()?;
        let ssl = Ssl::new(self.acceptor.context()).map_err(ssl_err)?;

        let mut result = ssl.accept(FdStream { fd: conn.fd() });
        loop {
            match result {
                Ok(stream) => {
                    return Ok(TlsSocket {
                        stream,
                        socket: conn,
                    })
                }
                Err(HandshakeError::WouldBlock(mid)) => {
                    suspend_for(&conn, mid.error().code())?;
                    result = mid.handshake();
                }
                Err(e) => {
                    log::error!("tls handshake with {} failed: {}", conn.addr(), e);
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string()));
                }
            }
        }
    }
}

/// An established TLS connection over a fiber-scheduled socket.
pub struct TlsSocket {
    stream: SslStream<FdStream>,
    /// Owns the fd (closes it exactly once) and the peer address
    socket: Socket,
}

impl TlsSocket {
    /// Read decrypted bytes; `Ok(0)` means the peer closed.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.ssl_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) => match e.code() {
                    ErrorCode::ZERO_RETURN => return Ok(0),
                    ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {
                        suspend_for(&self.socket, e.code())?;
                    }
                    _ => {
                        log::error!(
                            "fiber {} tls read failed: {}",
                            fiber_tls::current_id(),
                            e
                        );
                        return Err(io::Error::new(io::ErrorKind::Other, e.to_string()));
                    }
                },
            }
        }
    }

    /// Write all of `buf` through TLS, suspending on backpressure.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut remaining = buf;
        while !remaining.is_empty() {
            match self.stream.ssl_write(remaining) {
                Ok(n) => remaining = &remaining[n..],
                Err(e) => match e.code() {
                    ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => {
                        suspend_for(&self.socket, e.code())?;
                    }
                    _ => {
                        log::error!(
                            "fiber {} tls write failed: {}",
                            fiber_tls::current_id(),
                            e
                        );
                        return Err(io::Error::new(io::ErrorKind::Other, e.to_string()));
                    }
                },
            }
        }
        Ok(())
    }

    /// Peer address of the underlying socket
    pub fn addr(&self) -> &str {
        self.socket.addr()
    }
}

/// Map an OpenSSL want-code to the matching poller interest and park
/// the calling fiber on the connection's fd.
fn suspend_for(conn: &Socket, code: ErrorCode) -> io::Result<()> {
    let interest = match code {
        ErrorCode::WANT_READ => Interest::READ,
        ErrorCode::WANT_WRITE => Interest::WRITE,
        _ => Interest::READ,
    };
    match conn.scheduler() {
        Some(sched) if fiber_tls::is_fiber() => {
            sched
                .register_io(conn.fd(), interest)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            sched
                .yield_current()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            Ok(())
        }
        _ => Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "tls operation would block outside a fiber",
        )),
    }
}

fn ssl_err<E: std::fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}
