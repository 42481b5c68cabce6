//! Upstream connection pool (C5, spec.md §4.4): a map from fingerprint to a
//! LIFO queue of idle, already-authenticated sockets. Grounded on the
//! teacher's single-mutex-guarded table pattern (`server/mod.rs`'s
//! `connection_list`/`session_table` behind a lock that is never held across
//! I/O), narrowed here to exactly the pool cntlm itself keeps.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::upstream::UpstreamDescriptor;
use proxy_core::{ProxyError, ProxyResult};

struct IdleSocket {
    socket: TcpStream,
    idle_since: Instant,
}

/// A socket just popped from (or about to enter) the pool, tagged with
/// whether it has ever completed an NTLM handshake.
pub struct Checkout {
    pub socket: TcpStream,
    pub fresh: bool,
}

pub struct ConnectionPool {
    idle_timeout: Duration,
    queues: Mutex<HashMap<String, Vec<IdleSocket>>>,
}

impl ConnectionPool {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout, queues: Mutex::new(HashMap::new()) }
    }

    /// Pops the most recently released socket for `upstream`, evicting any
    /// stale entries found ahead of it (spec.md §4.4 eviction rule — checked
    /// lazily on acquire, no background sweeper). Dials a fresh socket when
    /// the queue is empty or fully evicted.
    pub async fn acquire(&self, upstream: &UpstreamDescriptor) -> ProxyResult<Checkout> {
        let fingerprint = upstream.fingerprint();
        let popped = {
            let mut queues = self.queues.lock().await;
            let queue = queues.entry(fingerprint.clone()).or_default();
            let mut found = None;
            while let Some(entry) = queue.pop() {
                if entry.idle_since.elapsed() > self.idle_timeout {
                    debug!(fingerprint = %fingerprint, "evicting idle pooled socket");
                    continue;
                }
                found = Some(entry);
                break;
            }
            found
        };

        if let Some(entry) = popped {
            return Ok(Checkout { socket: entry.socket, fresh: false });
        }

        let socket = TcpStream::connect((upstream.host.as_str(), upstream.port))
            .await
            .map_err(|e| ProxyError::transport(format!("connecting to upstream {upstream}: {e}")))?;
        Ok(Checkout { socket, fresh: true })
    }

    /// Returns a socket to the pool. Callers must only call this when the
    /// socket is certified clean (I3): no pending bytes, a keep-alive
    /// response, no protocol error. Anything else must go through
    /// [`Self::discard`] instead — there is no way to un-release a socket.
    pub async fn release(&self, upstream: &UpstreamDescriptor, socket: TcpStream) {
        let mut queues = self.queues.lock().await;
        queues
            .entry(upstream.fingerprint())
            .or_default()
            .push(IdleSocket { socket, idle_since: Instant::now() });
    }

    /// Unconditional close; the socket is simply dropped.
    pub fn discard(&self, socket: TcpStream) {
        drop(socket);
    }

    #[cfg(test)]
    pub async fn len(&self, upstream: &UpstreamDescriptor) -> usize {
        self.queues.lock().await.get(&upstream.fingerprint()).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_listener() -> (TcpListener, UpstreamDescriptor) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, UpstreamDescriptor::new(addr.ip().to_string(), addr.port()))
    }

    #[tokio::test]
    async fn acquire_on_empty_pool_dials_a_fresh_socket() {
        let (listener, upstream) = loopback_listener().await;
        let pool = ConnectionPool::new(Duration::from_secs(60));
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let checkout = pool.acquire(&upstream).await.unwrap();
        assert!(checkout.fresh);
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn release_then_acquire_reuses_the_same_connection_lifo() {
        let (listener, upstream) = loopback_listener().await;
        let pool = ConnectionPool::new(Duration::from_secs(60));
        let accept = tokio::spawn(async move {
            let (a, _) = listener.accept().await.unwrap();
            a
        });
        let checkout = pool.acquire(&upstream).await.unwrap();
        let _server_side = accept.await.unwrap();

        pool.release(&upstream, checkout.socket).await;
        assert_eq!(pool.len(&upstream).await, 1);

        let reused = pool.acquire(&upstream).await.unwrap();
        assert!(!reused.fresh);
        assert_eq!(pool.len(&upstream).await, 0);
    }

    #[tokio::test]
    async fn acquire_evicts_sockets_past_the_idle_timeout() {
        let (listener, upstream) = loopback_listener().await;
        let pool = ConnectionPool::new(Duration::from_millis(1));

        let accept_first = tokio::spawn(async move {
            let (a, _) = listener.accept().await.unwrap();
            (listener, a)
        });
        let checkout = pool.acquire(&upstream).await.unwrap();
        let (listener, _server_side) = accept_first.await.unwrap();
        pool.release(&upstream, checkout.socket).await;

        tokio::time::sleep(Duration::from_millis(20)).await;

        let accept_second = tokio::spawn(async move { listener.accept().await.unwrap() });
        let reacquired = pool.acquire(&upstream).await.unwrap();
        assert!(reacquired.fresh, "stale pooled socket should have been evicted, forcing a fresh dial");
        accept_second.await.unwrap();
        assert_eq!(pool.len(&upstream).await, 0);
    }

    #[tokio::test]
    async fn discard_closes_the_socket_without_pooling_it() {
        let (listener, upstream) = loopback_listener().await;
        let pool = ConnectionPool::new(Duration::from_secs(60));
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let checkout = pool.acquire(&upstream).await.unwrap();
        accept.await.unwrap();

        pool.discard(checkout.socket);
        assert_eq!(pool.len(&upstream).await, 0);
    }
}
