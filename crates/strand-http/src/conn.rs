//! Buffered HTTP connection over a fiber socket
//!
//! Assembles complete requests from the byte stream: reads until the
//! blank line, then completes the body per `Content-Length`. Bytes
//! past the current request stay buffered for the next one
//! (pipelining-friendly).

use std::io;

use strand_net::Socket;

use crate::message::{HttpRequest, HttpResponse};

const READ_CHUNK: usize = 4096;

/// One HTTP connection: a socket plus the partial-request buffer.
pub struct HttpConn {
    socket: Socket,
    buf: Vec<u8>,
}

impl HttpConn {
    pub fn new(socket: Socket) -> HttpConn {
        HttpConn {
            socket,
            buf: Vec::new(),
        }
    }

    /// Peer address of the underlying socket
    pub fn peer(&self) -> &str {
        self.socket.addr()
    }

    /// Read one complete request.
    ///
    /// `Ok(None)` means the peer closed cleanly between requests; a
    /// close mid-request is an error.
    pub fn read_request(&mut self) -> io::Result<Option<HttpRequest>> {
        loop {
            if let Some(head_end) = find_blank_line(&self.buf) {
                return self.finish_request(head_end).map(Some);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.socket.read(&mut chunk)?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-request",
                ));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Serialize and send a response.
    pub fn write_response(&mut self, response: &HttpResponse) -> io::Result<()> {
        self.socket.write_all(&response.encode())
    }

    fn finish_request(&mut self, head_end: usize) -> io::Result<HttpRequest> {
        let head = std::str::from_utf8(&self.buf[..head_end]).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "request head is not UTF-8")
        })?;
        let mut request = HttpRequest::parse(head).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "malformed request head")
        })?;

        // Everything after the blank line belongs to the body (and
        // possibly the next pipelined request)
        let mut body = self.buf.split_off(head_end);
        self.buf.clear();

        let need = request.content_length();
        while body.len() < need {
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.socket.read(&mut chunk)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-body",
                ));
            }
            body.extend_from_slice(&chunk[..n]);
        }

        let leftover = body.split_off(need);
        self.buf = leftover;
        request.body = body;
        Ok(request)
    }
}

/// Byte offset just past the `\r\n\r\n` head terminator, if present.
fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_blank_line() {
        assert_eq!(find_blank_line(b"GET / HTTP/1.1\r\n\r\n"), Some(18));
        assert_eq!(find_blank_line(b"partial head\r\n"), None);
        assert_eq!(find_blank_line(b""), None);
    }
}
