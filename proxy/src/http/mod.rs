pub mod codec;
pub mod message;

pub use codec::{copy_body, read_request_head, read_response_head, write_request_head, write_response_head};
pub use message::{BodyLength, HttpRequest, HttpResponse};

/// Header names stripped before forwarding in either direction (spec.md
/// §4.5): connection-scoped, not end-to-end. `Transfer-Encoding` is
/// deliberately absent from this list even though RFC 7230 6.1 names it
/// hop-by-hop: this proxy relays a body's existing framing rather than
/// decoding and re-encoding it, so the header must survive to the next hop
/// unchanged or the body bytes already written would no longer match what
/// the head claims.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Proxy-Connection",
    "TE",
    "Trailer",
    "Upgrade",
];

/// Strips hop-by-hop headers, including any header named *by* the
/// `Connection` header's value (RFC 7230 6.1), before relaying a head.
pub fn strip_hop_by_hop(headers: &mut proxy_core::containers::AssocList) {
    if let Some(connection) = headers.get("Connection") {
        let extra: Vec<String> = connection.split(',').map(|t| t.trim().to_string()).collect();
        for name in extra {
            if !name.is_empty() {
                headers.remove(&name);
            }
        }
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_core::containers::AssocList;

    #[test]
    fn strip_hop_by_hop_removes_standard_and_named_headers() {
        let mut headers = AssocList::new();
        headers.push("Connection", "close, X-Custom");
        headers.push("X-Custom", "value");
        headers.push("Host", "example.com");
        strip_hop_by_hop(&mut headers);
        assert!(!headers.contains("Connection"));
        assert!(!headers.contains("X-Custom"));
        assert!(headers.contains("Host"));
    }
}
