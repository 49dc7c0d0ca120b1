//! # strand-http
//!
//! A small HTTP/1.1 server shell over strand fibers.
//!
//! The listener fiber accepts connections; every accepted connection
//! gets its own worker fiber running blocking-style read/route/respond
//! code. All socket I/O suspends through the scheduler, so a handful
//! of worker threads serve many connections.
//!
//! - `message` - request/response types, parse and encode
//! - `conn` - buffered request assembly over a socket
//! - `router` - path-segment route tree
//! - `server` - the listener/worker shell

pub mod conn;
pub mod message;
pub mod router;
pub mod server;

pub use conn::HttpConn;
pub use message::{HttpRequest, HttpResponse};
pub use router::{Handler, RouteTree};
pub use server::HttpServer;
