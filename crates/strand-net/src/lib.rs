//! # strand-net
//!
//! Blocking-style networking for fibers.
//!
//! `Socket` wraps a non-blocking OS socket. Every operation that would
//! block instead registers interest with the scheduler and yields the
//! worker thread; the poller resumes the fiber when the fd is ready.
//! Called off-fiber (or with no scheduler attached) the same
//! operations surface `WouldBlock`.
//!
//! The `tls` feature adds `TlsListener`/`TlsSocket`, the same loop
//! shape over OpenSSL's `WANT_READ`/`WANT_WRITE`.

pub mod addr;
pub mod socket;

#[cfg(feature = "tls")]
pub mod tls;

pub use socket::{Socket, SocketKind};

#[cfg(feature = "tls")]
pub use tls::{TlsListener, TlsSocket};
