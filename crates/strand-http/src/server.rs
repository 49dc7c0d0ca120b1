//! HTTP server shell
//!
//! The listener fiber accepts connections in a loop and submits one
//! worker fiber per connection. Workers run blocking-style
//! read-request / route / respond code; every would-block inside
//! suspends the fiber, not the thread.

use std::io;
use std::sync::Arc;

use strand_core::error::{SchedError, SchedResult};
use strand_core::id::FiberId;
use strand_net::{Socket, SocketKind};
use strand_runtime::{Scheduler, SchedulerConfig};

use crate::conn::HttpConn;
use crate::message::{HttpRequest, HttpResponse};
use crate::router::{Handler, RouteTree};

const ACCEPT_BACKLOG: i32 = 1024;

/// The HTTP server framework shell.
pub struct HttpServer {
    listener: Socket,
    routes: RouteTree,
    sched: Scheduler,
}

impl HttpServer {
    /// Bind a server on `addr`:`port`, installing a global scheduler
    /// with `thread_count` workers if none is installed yet.
    pub fn new(addr: &str, port: u16, thread_count: usize) -> io::Result<HttpServer> {
        let sched = match Scheduler::try_current() {
            Some(sched) => sched,
            None => {
                Scheduler::install(SchedulerConfig::new().thread_count(thread_count))
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            }
        };
        HttpServer::with_scheduler(sched, addr, port)
    }

    /// Bind a server that spawns its fibers on an explicit scheduler.
    pub fn with_scheduler(sched: Scheduler, addr: &str, port: u16) -> io::Result<HttpServer> {
        let listener = Socket::create_in(Some(sched.clone()), SocketKind::Tcp, addr, port)?;
        listener.set_reuseaddr(true)?;
        log::info!("http server bound on {}:{}", addr, port);

        let mut routes = RouteTree::new();
        routes.set_default_handler(default_handler());

        Ok(HttpServer {
            listener,
            routes,
            sched,
        })
    }

    /// Register a handler under a path.
    pub fn route<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        self.routes.insert(path, Arc::new(handler));
    }

    /// Replace the fallback handler.
    pub fn set_default_handler(&mut self, handler: Handler) {
        self.routes.set_default_handler(handler);
    }

    /// Bound address and port (useful after binding port 0).
    pub fn local_addr(&self) -> io::Result<(String, u16)> {
        self.listener.local_addr()
    }

    /// Start listening and spawn the listener fiber.
    ///
    /// Returns the listener fiber's id; the server then runs entirely
    /// on the scheduler's workers.
    pub fn serve(self) -> SchedResult<FiberId> {
        let HttpServer {
            listener,
            routes,
            sched,
        } = self;

        listener.listen(ACCEPT_BACKLOG).map_err(SchedError::from)?;
        let routes = Arc::new(routes);

        let accept_sched = sched.clone();
        sched.spawn(move || accept_loop(listener, routes, accept_sched))
    }
}

/// Listener fiber body: accept until the socket or scheduler goes away.
fn accept_loop(listener: Socket, routes: Arc<RouteTree>, sched: Scheduler) {
    loop {
        match listener.accept() {
            Ok(conn) => {
                log::info!("connection from {}:{}", conn.addr(), conn.port());
                let routes = routes.clone();
                if let Err(e) = sched.spawn(move || worker(conn, routes)) {
                    log::error!("spawning connection worker failed: {}", e);
                    return;
                }
            }
            Err(e) => {
                log::error!("accept failed: {}", e);
                return;
            }
        }
    }
}

/// Connection worker fiber body: serve requests until the peer leaves.
fn worker(conn: Socket, routes: Arc<RouteTree>) {
    let peer = format!("{}:{}", conn.addr(), conn.port());
    let mut http = HttpConn::new(conn);
    loop {
        let request = match http.read_request() {
            Ok(Some(request)) => request,
            Ok(None) => {
                log::debug!("{} disconnected", peer);
                return;
            }
            Err(e) => {
                log::warn!("read from {} failed: {}", peer, e);
                return;
            }
        };

        log::info!("{} {} from {}", request.method, request.url, peer);
        let handler = routes.find(&request.url);
        let response = handler(&request);

        if let Err(e) = http.write_response(&response) {
            log::warn!("write to {} failed: {}", peer, e);
            return;
        }
    }
}

fn default_handler() -> Handler {
    Arc::new(|_req| {
        let mut res = HttpResponse::ok("<h1>nothing is in here-_-</h1>");
        res.add_header("Server", "strand-httpd/0.5");
        res.add_header("Content-Type", "text/html");
        res
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    fn scheduler() -> Scheduler {
        Scheduler::new(
            SchedulerConfig::new()
                .thread_count(2)
                .stack_size(256 * 1024),
        )
        .unwrap()
    }

    fn request(port: u16, path: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        write!(stream, "GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).unwrap();

        // Read until the declared body is complete
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed early");
            raw.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&raw);
            if let Some(head_end) = text.find("\r\n\r\n") {
                let content_length = text
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if raw.len() >= head_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8(raw).unwrap()
    }

    #[test]
    fn test_serve_routes_and_default() {
        let sched = scheduler();
        let mut server = HttpServer::with_scheduler(sched.clone(), "127.0.0.1", 0).unwrap();
        server.route("/hello", |_req| HttpResponse::ok("hi there"));
        let (_, port) = server.local_addr().unwrap();
        server.serve().unwrap();

        let reply = request(port, "/hello");
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert!(reply.ends_with("hi there"));

        let fallback = request(port, "/missing");
        assert!(fallback.contains("nothing is in here"));

        sched.shutdown();
    }

    #[test]
    fn test_keep_alive_serves_multiple_requests() {
        let sched = scheduler();
        let mut server = HttpServer::with_scheduler(sched.clone(), "127.0.0.1", 0).unwrap();
        server.route("/count", |_req| HttpResponse::ok("tick"));
        let (_, port) = server.local_addr().unwrap();
        server.serve().unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        for _ in 0..3 {
            write!(stream, "GET /count HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
            let mut seen = Vec::new();
            let mut chunk = [0u8; 1024];
            while !String::from_utf8_lossy(&seen).contains("tick") {
                let n = stream.read(&mut chunk).unwrap();
                assert!(n > 0);
                seen.extend_from_slice(&chunk[..n]);
            }
        }

        sched.shutdown();
    }
}
