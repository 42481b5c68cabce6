//! Direct forwarder (C7, spec.md §4.6): same public contract as
//! [`super::RequestForwarder`] but talks straight to the request's own
//! origin, with no pool and no NTLM handshake. Used for no-proxy matches and
//! for PAC `DIRECT` results.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use proxy_core::{ProxyError, ProxyResult};

use super::ForwardOutcome;
use crate::config::ProxyConfig;
use crate::http::{copy_body, read_response_head, strip_hop_by_hop, write_request_head, write_response_head, HttpRequest};

pub struct DirectForwarder {
    config: Arc<ProxyConfig>,
}

impl DirectForwarder {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        Self { config }
    }

    pub async fn handle<R, W>(&self, client_reader: &mut R, client_writer: &mut W, request: &HttpRequest) -> ProxyResult<ForwardOutcome>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let (host, port) = target_host_port(request)?;

        let socket = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| ProxyError::transport(io::Error::new(io::ErrorKind::TimedOut, "connect to origin timed out")))?
            .map_err(ProxyError::from)?;

        if request.is_connect() {
            client_writer
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .map_err(ProxyError::from)?;
            return Ok(ForwardOutcome::Upgrade { upstream: socket });
        }

        let (read_half, mut write_half) = socket.into_split();
        let mut upstream_reader = BufReader::new(read_half);

        let mut prepared = request.clone();
        strip_hop_by_hop(&mut prepared.headers);
        let keep_alive = request.keep_alive_requested();
        prepared.headers.set("Connection", if keep_alive { "keep-alive" } else { "close" });
        prepared.target = to_origin_form(&prepared.target);

        write_request_head(&mut write_half, &prepared).await?;
        copy_body(client_reader, &mut write_half, request.body_length()).await?;

        let response = read_response_head(&mut upstream_reader).await?;
        let client_keep_alive = keep_alive && response.keep_alive_offered();

        let mut client_response = response.clone();
        strip_hop_by_hop(&mut client_response.headers);
        client_response.headers.set("Connection", if client_keep_alive { "keep-alive" } else { "close" });

        write_response_head(client_writer, &client_response).await.map_err(ProxyError::from)?;
        copy_body(&mut upstream_reader, client_writer, response.body_length(&request.method)).await?;

        Ok(ForwardOutcome::Done { keep_alive: client_keep_alive })
    }
}

/// Splits a CONNECT target (`host:port`) or an absolute-form request URL
/// into a dial address, defaulting the port by scheme when omitted.
fn target_host_port(request: &HttpRequest) -> ProxyResult<(String, u16)> {
    if request.is_connect() {
        let (host, port) = request
            .target
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::http_malformed("CONNECT target is not host:port"))?;
        let port: u16 = port.parse().map_err(|_| ProxyError::http_malformed("CONNECT port is not numeric"))?;
        return Ok((host.to_string(), port));
    }

    let rest = request
        .target
        .splitn(2, "://")
        .nth(1)
        .ok_or_else(|| ProxyError::http_malformed("direct forwarding requires an absolute-form request target"))?;
    let scheme_is_https = request.target.to_ascii_lowercase().starts_with("https://");
    let authority = rest.split('/').next().unwrap_or(rest);
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().map_err(|_| ProxyError::http_malformed("request URL port is not numeric"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), if scheme_is_https { 443 } else { 80 })),
    }
}

/// `http://host:port/path?query` → `/path?query`, the rewrite spec.md §4.5
/// requires whenever the chosen upstream is DIRECT.
fn to_origin_form(target: &str) -> String {
    let Some(rest) = target.splitn(2, "://").nth(1) else {
        return target.to_string();
    };
    match rest.find('/') {
        Some(idx) => rest[idx..].to_string(),
        None => "/".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_host_port_parses_connect_target() {
        let req = HttpRequest::new("CONNECT", "example.com:443", "HTTP/1.1");
        assert_eq!(target_host_port(&req).unwrap(), ("example.com".to_string(), 443));
    }

    #[test]
    fn target_host_port_defaults_http_port_to_80() {
        let req = HttpRequest::new("GET", "http://example.com/path", "HTTP/1.1");
        assert_eq!(target_host_port(&req).unwrap(), ("example.com".to_string(), 80));
    }

    #[test]
    fn target_host_port_defaults_https_port_to_443() {
        let req = HttpRequest::new("GET", "https://example.com/path", "HTTP/1.1");
        assert_eq!(target_host_port(&req).unwrap(), ("example.com".to_string(), 443));
    }

    #[test]
    fn to_origin_form_strips_scheme_and_authority() {
        assert_eq!(to_origin_form("http://example.com:8080/a/b?c=1"), "/a/b?c=1");
        assert_eq!(to_origin_form("http://example.com"), "/");
    }
}
