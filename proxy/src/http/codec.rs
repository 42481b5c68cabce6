//! Async head parsing/writing and body copying over the framing rules in
//! [`super::message`]. Grounded in spirit on the teacher's
//! `socket::message_stream::stream_async` (`read_message`/`write_message`
//! pairing one read side with one write side) but reworked around HTTP's
//! line-oriented head instead of a fixed binary header.

use proxy_core::containers::AssocList;
use proxy_core::{ProxyError, ProxyResult};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::message::{BodyLength, HttpRequest, HttpResponse, MAX_HEADER_SECTION_BYTES, MAX_LINE_BYTES};

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> ProxyResult<Option<String>> {
    let mut buf = Vec::new();
    let n = reader
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await
        .map_err(ProxyError::from)?;

    if n == 0 {
        return Ok(None);
    }
    if buf.len() > MAX_LINE_BYTES {
        return Err(ProxyError::http_malformed("request/status line exceeds 8 KiB limit"));
    }
    while buf.last() == Some(&b'\n') || buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf).map(Some).map_err(|_| ProxyError::http_malformed("header line is not valid UTF-8"))
}

/// Reads one HTTP request head (start line + headers, with RFC 7230 obsolete
/// line folding joined back onto the prior header). Returns `None` on a
/// clean EOF before any bytes of a new request arrive — the signal to close
/// a keep-alive connection quietly.
pub async fn read_request_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> ProxyResult<Option<HttpRequest>> {
    let Some(start_line) = read_line(reader).await? else {
        return Ok(None);
    };
    if start_line.is_empty() {
        // Leading CRLF before a request line is legal noise (RFC 7230 3.5); skip it.
        return Box::pin(read_request_head(reader)).await;
    }
    let mut parts = start_line.splitn(3, ' ');
    let method = parts.next().ok_or_else(|| ProxyError::http_malformed("missing method"))?;
    let target = parts.next().ok_or_else(|| ProxyError::http_malformed("missing request-target"))?;
    let version = parts.next().ok_or_else(|| ProxyError::http_malformed("missing HTTP version"))?;

    let mut req = HttpRequest::new(method, target, version);
    req.headers = read_headers(reader).await?;
    Ok(Some(req))
}

pub async fn read_response_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> ProxyResult<HttpResponse> {
    let start_line = read_line(reader)
        .await?
        .ok_or_else(|| ProxyError::http_malformed("connection closed before a status line"))?;

    let mut parts = start_line.splitn(3, ' ');
    let version = parts.next().ok_or_else(|| ProxyError::http_malformed("missing HTTP version"))?;
    let status: u16 = parts
        .next()
        .ok_or_else(|| ProxyError::http_malformed("missing status code"))?
        .parse()
        .map_err(|_| ProxyError::http_malformed("status code is not numeric"))?;
    let reason = parts.next().unwrap_or("");

    let mut resp = HttpResponse::new(version, status, reason);
    resp.headers = read_headers(reader).await?;
    Ok(resp)
}

async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> ProxyResult<AssocList> {
    let mut headers = AssocList::new();
    let mut total = 0usize;

    loop {
        let line = read_line(reader).await?.ok_or_else(|| ProxyError::http_malformed("connection closed mid-headers"))?;
        total += line.len() + 2;
        if total > MAX_HEADER_SECTION_BYTES {
            return Err(ProxyError::http_malformed("header section exceeds 64 KiB limit"));
        }
        if line.is_empty() {
            break;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            // Obsolete line folding: append to the previous header's value.
            if let Some(last) = headers.iter().last() {
                let (name, value) = (last.0.to_string(), format!("{} {}", last.1, line.trim()));
                headers.remove(&name);
                headers.push(name, value);
                continue;
            }
            return Err(ProxyError::http_malformed("continuation line with no preceding header"));
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::http_malformed("header line missing ':'"))?;
        headers.push(name.trim(), value.trim());
    }

    Ok(headers)
}

pub async fn write_request_head<W: AsyncWrite + Unpin>(writer: &mut W, req: &HttpRequest) -> ProxyResult<()> {
    let mut buf = format!("{} {} {}\r\n", req.method, req.target, req.version);
    for (name, value) in req.headers.iter() {
        buf.push_str(name);
        buf.push_str(": ");
        buf.push_str(value);
        buf.push_str("\r\n");
    }
    buf.push_str("\r\n");
    writer.write_all(buf.as_bytes()).await.map_err(ProxyError::from)
}

pub async fn write_response_head<W: AsyncWrite + Unpin>(writer: &mut W, resp: &HttpResponse) -> ProxyResult<()> {
    let mut buf = format!("{} {} {}\r\n", resp.version, resp.status, resp.reason);
    for (name, value) in resp.headers.iter() {
        buf.push_str(name);
        buf.push_str(": ");
        buf.push_str(value);
        buf.push_str("\r\n");
    }
    buf.push_str("\r\n");
    writer.write_all(buf.as_bytes()).await.map_err(ProxyError::from)
}

/// Relays a body from `reader` to `writer` according to `length`, handling
/// chunked trailers and exact-length framing. `UntilClose` copies until EOF,
/// which the caller must only select on the last response of a connection.
pub async fn copy_body<R, W>(reader: &mut R, writer: &mut W, length: BodyLength) -> ProxyResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match length {
        BodyLength::None => Ok(()),
        BodyLength::Fixed(n) => copy_fixed(reader, writer, n).await,
        BodyLength::UntilClose => copy_until_close(reader, writer).await,
        BodyLength::Chunked => copy_chunked(reader, writer).await,
    }
}

async fn copy_fixed<R, W>(reader: &mut R, writer: &mut W, mut remaining: u64) -> ProxyResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await.map_err(ProxyError::from)?;
        if n == 0 {
            return Err(ProxyError::http_malformed("connection closed before fixed-length body finished"));
        }
        writer.write_all(&buf[..n]).await.map_err(ProxyError::from)?;
        remaining -= n as u64;
    }
    Ok(())
}

async fn copy_until_close<R, W>(reader: &mut R, writer: &mut W) -> ProxyResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::io::copy(reader, writer).await.map(|_| ()).map_err(ProxyError::from)
}

async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> ProxyResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;

    loop {
        let size_line = read_line(reader)
            .await?
            .ok_or_else(|| ProxyError::http_malformed("connection closed mid chunk size"))?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_str, 16).map_err(|_| ProxyError::http_malformed("invalid chunk size"))?;

        // Relay the size line (and any chunk-extensions) verbatim rather than
        // re-encoding it — chunked framing must be forwarded byte-for-byte.
        writer.write_all(size_line.as_bytes()).await.map_err(ProxyError::from)?;
        writer.write_all(b"\r\n").await.map_err(ProxyError::from)?;

        if size == 0 {
            // Trailer section: relay each header line verbatim through to the final CRLF.
            loop {
                let line = read_line(reader).await?.ok_or_else(|| ProxyError::http_malformed("connection closed mid trailers"))?;
                writer.write_all(line.as_bytes()).await.map_err(ProxyError::from)?;
                writer.write_all(b"\r\n").await.map_err(ProxyError::from)?;
                if line.is_empty() {
                    break;
                }
            }
            break;
        }

        let mut remaining = size;
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = reader.read(&mut buf[..want]).await.map_err(ProxyError::from)?;
            if n == 0 {
                return Err(ProxyError::http_malformed("connection closed mid chunk body"));
            }
            writer.write_all(&buf[..n]).await.map_err(ProxyError::from)?;
            remaining -= n as u64;
        }

        let trailing_crlf = read_line(reader).await?.ok_or_else(|| ProxyError::http_malformed("missing chunk terminator"))?;
        if !trailing_crlf.is_empty() {
            return Err(ProxyError::http_malformed("chunk data not followed by CRLF"));
        }
        writer.write_all(b"\r\n").await.map_err(ProxyError::from)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn read_request_head_parses_start_line_and_headers() {
        let raw = b"GET /path HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(&raw[..]));
        let req = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/path");
        assert_eq!(req.headers.get("Host"), Some("example.com"));
    }

    #[tokio::test]
    async fn read_request_head_returns_none_on_clean_eof() {
        let mut reader = BufReader::new(Cursor::new(&b""[..]));
        assert!(read_request_head(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_headers_joins_folded_continuation_lines() {
        let raw = b"GET / HTTP/1.1\r\nX-Long: part-one\r\n part-two\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(&raw[..]));
        let req = read_request_head(&mut reader).await.unwrap().unwrap();
        assert_eq!(req.headers.get("X-Long"), Some("part-one part-two"));
    }

    #[tokio::test]
    async fn copy_fixed_body_relays_exact_byte_count() {
        let mut reader = BufReader::new(Cursor::new(b"hello-extra".to_vec()));
        let mut out = Vec::new();
        copy_body(&mut reader, &mut out, BodyLength::Fixed(5)).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn copy_chunked_body_relays_all_chunks_and_trailer() {
        let raw = b"5\r\nhello\r\n0\r\n\r\n";
        let mut reader = BufReader::new(Cursor::new(&raw[..]));
        let mut out = Vec::new();
        copy_body(&mut reader, &mut out, BodyLength::Chunked).await.unwrap();
        assert_eq!(out, raw);
    }
}
