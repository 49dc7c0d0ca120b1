//! # strand - stackful cooperative fibers
//!
//! A user-space task runtime that multiplexes many stackful fibers
//! onto a bounded pool of worker threads, with an epoll poller turning
//! blocking-style socket code into suspend/resume points.
//!
//! ## Features
//!
//! - **Stackful fibers**: ~64-byte saved context, private guarded
//!   1 MiB stacks, hand-written context switch
//! - **Cooperative**: a fiber runs until it yields; socket I/O yields
//!   implicitly on would-block
//! - **Multi-threaded**: fibers migrate freely between workers across
//!   suspensions
//! - **Blocking-style networking**: `Socket::{accept, read, write_all}`
//!   look synchronous, never block a thread
//! - **HTTP shell**: listener fiber + worker fiber per connection
//!
//! ## Quick Start
//!
//! ```ignore
//! use strand::{HttpResponse, HttpServer};
//!
//! fn main() -> std::io::Result<()> {
//!     let mut server = HttpServer::new("127.0.0.1", 8080, 4)?;
//!     server.route("/hello", |_req| HttpResponse::ok("hello from a fiber"));
//!     server.serve().expect("serve failed");
//!     loop {
//!         std::thread::park();
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     User code                        │
//! │        spawn(), Socket, HttpServer handlers          │
//! └──────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌──────────────────────────────────────────────────────┐
//! │  Scheduler: fiber registry · free list · job pool    │
//! │  worker threads ◀── resume jobs ──── poller thread   │
//! └──────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌──────────────────────────────────────────────────────┐
//! │   context switch (x86_64 / aarch64) · epoll · libc   │
//! └──────────────────────────────────────────────────────┘
//! ```

pub use strand_core::{FiberId, FiberState, SchedError, SchedResult};
pub use strand_http::{HttpConn, HttpRequest, HttpResponse, HttpServer, RouteTree};
pub use strand_net::{Socket, SocketKind};
pub use strand_runtime::{Fiber, Interest, Scheduler, SchedulerConfig};

#[cfg(feature = "tls")]
pub use strand_net::{TlsListener, TlsSocket};

/// Suspend the calling fiber, handing the worker thread back to the
/// scheduler. Off-fiber this is an error.
pub fn yield_current() -> SchedResult<()> {
    Scheduler::current()?.yield_current()
}

/// Spawn a task on the installed global scheduler.
pub fn spawn<F>(f: F) -> SchedResult<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    Scheduler::current()?.spawn(f)
}
