//! HTTP/1.1 message types
//!
//! Request: request line, header fields, optional body.
//! Response: status line, header fields, body.

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A parsed HTTP request.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub version: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Parse the head of a request (request line + headers, up to and
    /// including the blank line). Returns `None` on a malformed head.
    pub fn parse(head: &str) -> Option<HttpRequest> {
        let mut lines = head.split("\r\n");

        let request_line = lines.next()?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?.to_string();
        let url = parts.next()?.to_string();
        let version = parts.next()?.to_string();

        let mut headers = BTreeMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (key, value) = line.split_once(':')?;
            headers.insert(key.trim().to_string(), value.trim().to_string());
        }

        Some(HttpRequest {
            method,
            url,
            version,
            headers,
            body: Vec::new(),
        })
    }

    /// Look up a header field, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Declared body length, defaulting to zero.
    pub fn content_length(&self) -> usize {
        self.header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// An HTTP response under construction.
///
/// The body is raw bytes, like the request body; handlers returning
/// binary payloads assign it directly.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub code: u16,
    pub reason: String,
    pub version: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(code: u16, reason: &str) -> HttpResponse {
        HttpResponse {
            code,
            reason: reason.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// 200 response with a body
    pub fn ok(body: impl Into<Vec<u8>>) -> HttpResponse {
        let mut res = HttpResponse::new(200, "OK");
        res.body = body.into();
        res
    }

    /// 404 response
    pub fn not_found() -> HttpResponse {
        let mut res = HttpResponse::new(404, "Not Found");
        res.body = b"<h1>404 Not Found</h1>".to_vec();
        res.add_header("Content-Type", "text/html");
        res
    }

    pub fn add_header(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_string(), value.to_string());
    }

    /// Serialize into wire form. Content-Length is filled in from the
    /// body when the handler did not set it.
    pub fn encode(&self) -> Vec<u8> {
        let mut head = String::new();
        let _ = write!(head, "{} {} {}\r\n", self.version, self.code, self.reason);
        for (key, value) in &self.headers {
            let _ = write!(head, "{}: {}\r\n", key, value);
        }
        if !self.headers.contains_key("Content-Length") {
            let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_head() {
        let head = "GET /index.html HTTP/1.1\r\nHost: localhost\r\nContent-Length: 12\r\n\r\n";
        let req = HttpRequest::parse(head).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.url, "/index.html");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.header("host"), Some("localhost"));
        assert_eq!(req.content_length(), 12);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(HttpRequest::parse("not http at all").is_none());
        assert!(HttpRequest::parse("").is_none());
    }

    #[test]
    fn test_missing_content_length_is_zero() {
        let req = HttpRequest::parse("GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.content_length(), 0);
    }

    #[test]
    fn test_encode_response() {
        let mut res = HttpResponse::ok("hello");
        res.add_header("Content-Type", "text/plain");
        let wire = String::from_utf8(res.encode()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("Content-Type: text/plain\r\n"));
        assert!(wire.contains("Content-Length: 5\r\n"));
        assert!(wire.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_encode_is_binary_safe() {
        let mut res = HttpResponse::new(200, "OK");
        res.body = vec![0x00, 0xFF, 0x80, 0x0A];
        let wire = res.encode();
        assert!(wire.ends_with(&[0x00, 0xFF, 0x80, 0x0A]));
        let head = String::from_utf8_lossy(&wire);
        assert!(head.contains("Content-Length: 4\r\n"));
    }

    #[test]
    fn test_encode_keeps_explicit_content_length() {
        let mut res = HttpResponse::new(204, "No Content");
        res.add_header("Content-Length", "0");
        let wire = String::from_utf8(res.encode()).unwrap();
        assert_eq!(wire.matches("Content-Length").count(), 1);
    }
}
