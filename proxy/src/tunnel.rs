//! CONNECT tunnel driver (C8, spec.md §4.7): an opaque bidirectional byte
//! pump between two already-established sockets, used both for HTTPS
//! CONNECT (after C6/C7 negotiate it) and for fixed-target `-L` tunnel
//! listeners. Grounded on the teacher's `stream_async`
//! (`socket/message_stream/stream_async.rs`), which also pairs one read half
//! with one write half per direction, generalized here to splice two full
//! duplex sockets instead of framing SMB messages.

use proxy_core::{ProxyError, ProxyResult};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Runs until either side closes or errors. Half-close is honored: once one
/// direction hits EOF, the opposite write half is shut down while the other
/// direction keeps draining to its own EOF, then both sides close (spec.md
/// §4.7). No framing assumptions are made — this is the path used for TLS.
pub async fn splice<A, B>(a: A, b: B) -> ProxyResult<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let a_to_b = async {
        let result = tokio::io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
        result
    };
    let b_to_a = async {
        let result = tokio::io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
        result
    };

    let (r1, r2) = tokio::join!(a_to_b, b_to_a);
    r1.map_err(ProxyError::from)?;
    r2.map_err(ProxyError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt as _};

    #[tokio::test]
    async fn splice_relays_bytes_in_both_directions() {
        let (mut client_end, client_side) = duplex(64);
        let (mut upstream_end, upstream_side) = duplex(64);

        let handle = tokio::spawn(splice(client_side, upstream_side));

        client_end.write_all(b"hello upstream").await.unwrap();
        let mut buf = [0u8; 14];
        upstream_end.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello upstream");

        upstream_end.write_all(b"hello client").await.unwrap();
        let mut buf2 = [0u8; 12];
        client_end.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"hello client");

        drop(client_end);
        drop(upstream_end);
        handle.await.unwrap().unwrap();
    }
}
