//! `Host` header extraction and normalization (spec §4.2).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpRouterError {
    #[error("no Host header present in request")]
    HostHeaderNotFound,
}

/// Strips an optional `:port` suffix from a `Host` header value.
pub fn normalize_host(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

/// Scans the raw bytes of an HTTP request (as read off the wire, before any
/// framing is otherwise understood) for the `Host` header and returns its
/// normalized (port-stripped) value.
///
/// Only the request line and header block are inspected; the search stops
/// at the first blank line. Matching is case-insensitive per RFC 7230.
pub fn extract_host(data: &[u8]) -> Result<String, HttpRouterError> {
    let text = String::from_utf8_lossy(data);

    for line in text.lines() {
        if line.is_empty() {
            break;
        }
        if line.len() >= 5 && line[..5].eq_ignore_ascii_case("host:") {
            let value = line[5..].trim();
            if value.is_empty() {
                continue;
            }
            return Ok(normalize_host(value).to_string());
        }
    }

    Err(HttpRouterError::HostHeaderNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_basic_host() {
        let req = b"GET / HTTP/1.1\r\nHost: app.local\r\n\r\n";
        assert_eq!(extract_host(req).unwrap(), "app.local");
    }

    #[test]
    fn strips_port_suffix() {
        let req = b"GET / HTTP/1.1\r\nHost: app.local:8989\r\n\r\n";
        assert_eq!(extract_host(req).unwrap(), "app.local");
    }

    #[test]
    fn case_insensitive_header_name() {
        let req = b"GET / HTTP/1.1\r\nhOsT: app.local\r\n\r\n";
        assert_eq!(extract_host(req).unwrap(), "app.local");
    }

    #[test]
    fn missing_host_errors() {
        let req = b"GET / HTTP/1.1\r\nUser-Agent: test\r\n\r\n";
        assert_eq!(extract_host(req), Err(HttpRouterError::HostHeaderNotFound));
    }

    #[test]
    fn stops_at_blank_line() {
        let req = b"GET / HTTP/1.1\r\n\r\nHost: after-body.local\r\n";
        assert_eq!(extract_host(req), Err(HttpRouterError::HostHeaderNotFound));
    }

    #[test]
    fn ipv4_host_with_port() {
        let req = b"GET / HTTP/1.1\r\nHost: 127.0.0.1:8080\r\n\r\n";
        assert_eq!(extract_host(req).unwrap(), "127.0.0.1");
    }
}
