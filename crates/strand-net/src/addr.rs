//! Address grammar and sockaddr resolution
//!
//! `"unix://<path>"` selects the unix domain; a literal containing
//! `':'` selects IPv6; anything else is IPv4. Resolution writes the
//! parsed address into a `sockaddr_storage` record.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Pick the socket domain for an address string.
pub fn domain_of(addr: &str) -> libc::c_int {
    if addr.starts_with("unix://") {
        libc::AF_UNIX
    } else if addr.contains(':') {
        libc::AF_INET6
    } else {
        libc::AF_INET
    }
}

/// Resolve `addr`/`port` into a sockaddr record.
///
/// Returns the storage and the length to pass to `bind`/`connect`.
pub fn resolve(addr: &str, port: u16) -> io::Result<(libc::sockaddr_storage, libc::socklen_t)> {
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };

    match domain_of(addr) {
        libc::AF_UNIX => {
            let path = &addr["unix://".len()..];
            let sun = &mut ss as *mut _ as *mut libc::sockaddr_un;
            let sun = unsafe { &mut *sun };
            sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
            let bytes = path.as_bytes();
            if bytes.is_empty() || bytes.len() >= sun.sun_path.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "unix socket path too long or empty",
                ));
            }
            for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }
            Ok((ss, mem::size_of::<libc::sockaddr_un>() as libc::socklen_t))
        }
        libc::AF_INET6 => {
            let ip: Ipv6Addr = addr.parse().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "invalid IPv6 address")
            })?;
            let sin6 = &mut ss as *mut _ as *mut libc::sockaddr_in6;
            let sin6 = unsafe { &mut *sin6 };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = port.to_be();
            sin6.sin6_addr.s6_addr = ip.octets();
            Ok((ss, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t))
        }
        _ => {
            let ip: Ipv4Addr = addr.parse().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "invalid IPv4 address")
            })?;
            let sin = &mut ss as *mut _ as *mut libc::sockaddr_in;
            let sin = unsafe { &mut *sin };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = port.to_be();
            sin.sin_addr.s_addr = u32::from(ip).to_be();
            Ok((ss, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t))
        }
    }
}

/// Extract the printable peer address and port from a sockaddr record.
pub fn peer_of(ss: &libc::sockaddr_storage) -> (String, u16) {
    match ss.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = ss as *const _ as *const libc::sockaddr_in;
            let sin = unsafe { &*sin };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            (ip.to_string(), u16::from_be(sin.sin_port))
        }
        libc::AF_INET6 => {
            let sin6 = ss as *const _ as *const libc::sockaddr_in6;
            let sin6 = unsafe { &*sin6 };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            (ip.to_string(), u16::from_be(sin6.sin6_port))
        }
        libc::AF_UNIX => {
            let sun = ss as *const _ as *const libc::sockaddr_un;
            let sun = unsafe { &*sun };
            let len = sun
                .sun_path
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(sun.sun_path.len());
            let path: String = sun.sun_path[..len]
                .iter()
                .map(|&c| c as u8 as char)
                .collect();
            (path, 0)
        }
        _ => (String::new(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_selection() {
        assert_eq!(domain_of("unix:///tmp/sock"), libc::AF_UNIX);
        assert_eq!(domain_of("::1"), libc::AF_INET6);
        assert_eq!(domain_of("fe80::1"), libc::AF_INET6);
        assert_eq!(domain_of("127.0.0.1"), libc::AF_INET);
        assert_eq!(domain_of("example"), libc::AF_INET);
    }

    #[test]
    fn test_resolve_v4_round_trip() {
        let (ss, len) = resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in>());
        let (ip, port) = peer_of(&ss);
        assert_eq!(ip, "127.0.0.1");
        assert_eq!(port, 8080);
    }

    #[test]
    fn test_resolve_v6_round_trip() {
        let (ss, _) = resolve("::1", 443).unwrap();
        let (ip, port) = peer_of(&ss);
        assert_eq!(ip, "::1");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_resolve_unix_path() {
        let (ss, _) = resolve("unix:///tmp/strand.sock", 0).unwrap();
        let (path, port) = peer_of(&ss);
        assert_eq!(path, "/tmp/strand.sock");
        assert_eq!(port, 0);
    }

    #[test]
    fn test_resolve_rejects_garbage() {
        assert!(resolve("not an ip", 1).is_err());
        assert!(resolve("unix://", 0).is_err());
    }
}
