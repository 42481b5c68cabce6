//! HTTP/1.x request and response head records (spec.md §4.1/§4.5), grounded
//! on the teacher's `protocol::header`/`protocol::body` split: a typed record
//! plus a deliberate separation between head parsing and body framing.

use proxy_core::containers::AssocList;

pub const MAX_LINE_BYTES: usize = 8 * 1024;
pub const MAX_HEADER_SECTION_BYTES: usize = 64 * 1024;

/// How a message body is framed on the wire (spec.md §4.1), in the priority
/// order `body_length` resolves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Chunked,
    Fixed(u64),
    UntilClose,
    None,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: AssocList,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, target: impl Into<String>, version: impl Into<String>) -> Self {
        Self { method: method.into(), target: target.into(), version: version.into(), headers: AssocList::new() }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// True when `target` is an absolute-form URI (`http://host/path`) rather
    /// than origin-form (`/path`) — distinguishes a forward-proxy request
    /// from a tunnel-relayed one (spec.md §4.1).
    pub fn is_absolute_form(&self) -> bool {
        self.target.contains("://")
    }

    pub fn keep_alive_requested(&self) -> bool {
        match self.headers.get("Connection") {
            Some(v) => !v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("close")),
            None => self.version != "HTTP/1.0",
        }
    }

    /// Request body framing (spec.md §4.1): chunked takes priority over a
    /// `Content-Length`; with neither, there is no body.
    pub fn body_length(&self) -> BodyLength {
        if is_chunked(&self.headers) {
            return BodyLength::Chunked;
        }
        if let Some(len) = content_length(&self.headers) {
            return BodyLength::Fixed(len);
        }
        BodyLength::None
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: AssocList,
}

impl HttpResponse {
    pub fn new(version: impl Into<String>, status: u16, reason: impl Into<String>) -> Self {
        Self { version: version.into(), status, reason: reason.into(), headers: AssocList::new() }
    }

    pub fn keep_alive_offered(&self) -> bool {
        match self.headers.get("Connection") {
            Some(v) => !v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("close")),
            None => self.version != "HTTP/1.0",
        }
    }

    /// Response body framing (spec.md §4.1): a HEAD response, 1xx/204/304,
    /// or a response to CONNECT never carries a body regardless of headers;
    /// otherwise chunked beats `Content-Length`, and an HTTP/1.1 response
    /// with neither reads until the connection closes.
    pub fn body_length(&self, request_method: &str) -> BodyLength {
        if request_method.eq_ignore_ascii_case("HEAD")
            || request_method.eq_ignore_ascii_case("CONNECT") && (200..300).contains(&self.status)
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return BodyLength::None;
        }
        if is_chunked(&self.headers) {
            return BodyLength::Chunked;
        }
        if let Some(len) = content_length(&self.headers) {
            return BodyLength::Fixed(len);
        }
        BodyLength::UntilClose
    }
}

fn is_chunked(headers: &AssocList) -> bool {
    headers
        .get("Transfer-Encoding")
        .is_some_and(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("chunked")))
}

fn content_length(headers: &AssocList) -> Option<u64> {
    headers.get("Content-Length").and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_length_prefers_chunked_over_content_length() {
        let mut req = HttpRequest::new("POST", "/", "HTTP/1.1");
        req.headers.push("Transfer-Encoding", "chunked");
        req.headers.push("Content-Length", "10");
        assert_eq!(req.body_length(), BodyLength::Chunked);
    }

    #[test]
    fn response_to_head_request_never_has_a_body() {
        let mut resp = HttpResponse::new("HTTP/1.1", 200, "OK");
        resp.headers.push("Content-Length", "500");
        assert_eq!(resp.body_length("HEAD"), BodyLength::None);
    }

    #[test]
    fn response_with_no_framing_header_reads_until_close() {
        let resp = HttpResponse::new("HTTP/1.1", 200, "OK");
        assert_eq!(resp.body_length("GET"), BodyLength::UntilClose);
    }

    #[test]
    fn http_10_without_connection_header_defaults_to_close() {
        let req = HttpRequest::new("GET", "/", "HTTP/1.0");
        assert!(!req.keep_alive_requested());
        let req11 = HttpRequest::new("GET", "/", "HTTP/1.1");
        assert!(req11.keep_alive_requested());
    }
}
