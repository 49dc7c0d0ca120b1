//! # strand HTTP/1.1 demo server
//!
//! One fiber per connection. Blocking-style code. epoll underneath.
//!
//! - The accept loop runs on a listener fiber and spawns a worker
//!   fiber for each connection
//! - Each worker reads, routes, responds using blocking-style calls
//! - Under the hood, would-block suspends the fiber; worker OS
//!   threads are never parked on a socket
//!
//! ## Usage
//!
//!     cargo run -p strand-httpd --release -- [--port 8080] [--workers 4]
//!
//! ## Benchmark
//!
//!     wrk -t4 -c100 -d10s http://127.0.0.1:8080/hello

use std::sync::atomic::{AtomicU64, Ordering};

use strand::{HttpResponse, HttpServer};

static HELLO_SERVED: AtomicU64 = AtomicU64::new(0);

fn parse_args() -> (u16, usize) {
    let mut port = 8080u16;
    let mut workers = 4usize;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                port = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| {
                        eprintln!("--port needs a number");
                        std::process::exit(2);
                    });
            }
            "--workers" => {
                workers = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| {
                        eprintln!("--workers needs a number");
                        std::process::exit(2);
                    });
            }
            other => {
                eprintln!("unknown argument: {}", other);
                eprintln!("usage: strand-httpd [--port 8080] [--workers 4]");
                std::process::exit(2);
            }
        }
    }
    (port, workers)
}

fn main() -> std::io::Result<()> {
    env_logger::init();
    let (port, workers) = parse_args();

    let mut server = HttpServer::new("127.0.0.1", port, workers)?;

    server.route("/hello", |_req| {
        let n = HELLO_SERVED.fetch_add(1, Ordering::Relaxed) + 1;
        let mut res = HttpResponse::ok(format!("Hello from a fiber! (#{})\n", n));
        res.add_header("Content-Type", "text/plain");
        res
    });

    server.route("/echo", |req| {
        let mut res = HttpResponse::ok(req.body.clone());
        res.add_header("Content-Type", "application/octet-stream");
        res
    });

    log::info!("listening on 127.0.0.1:{} with {} workers", port, workers);
    server.serve().expect("failed to start listener fiber");

    loop {
        std::thread::park();
    }
}
