//! Acceptor/dispatcher (C10, spec.md §4.9): owns every listener socket,
//! spawns one worker task per accepted connection, and drains those workers
//! on shutdown. Grounded on the teacher's `StartSMBServer::start` (one
//! `tokio::spawn` per accepted connection off a single listener), generalized
//! here to N listeners of three different kinds multiplexed onto one
//! shutdown signal.
//!
//! The source this spec was distilled from has each worker thread append
//! itself to a list the acceptor later joins under a lock (spec.md §9's
//! "thread list for join" note flags this as a manual-threading artifact).
//! Here that list is a plain `Vec<JoinHandle<()>>` behind a `std::sync::Mutex`
//! — still the "finished-workers list lock" spec.md §5 names, just pushed to
//! by `tokio::spawn`'s return value instead of a thread appending itself.
//!
//! `shutdown` counts signals received (0 = running): 1 means "stop accepting,
//! drain in-flight workers", 2 means "force exit now" (spec.md §4.9/§6).

use std::sync::Mutex;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use proxy_core::{ProxyError, ProxyResult};

use crate::config::{ListenerSpec, ProxyConfig};
use crate::forwarder::{ForwardOutcome, RequestForwarder};
use crate::http::{read_request_head, write_response_head, HttpResponse};
use crate::pool::ConnectionPool;
use crate::socks5::Socks5Server;
use crate::tunnel;

/// Runs the worker inline on the acceptor task instead of spawning it —
/// the "serialize" debug mode spec.md §4.9 names, useful for deterministic
/// tracing of a single connection at a time. Off by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptorOptions {
    pub serialize: bool,
}

pub struct Acceptor {
    config: Arc<ProxyConfig>,
    forwarder: Arc<RequestForwarder>,
    socks5: Arc<Socks5Server>,
    options: AcceptorOptions,
}

impl Acceptor {
    pub fn new(config: Arc<ProxyConfig>, options: AcceptorOptions) -> Self {
        let pool = Arc::new(ConnectionPool::new(config.pool_idle_timeout));
        let forwarder = Arc::new(RequestForwarder::new(config.clone(), pool));
        let socks5 = Arc::new(Socks5Server::new(config.clone(), forwarder.clone()));
        Self { config, forwarder, socks5, options }
    }

    /// Binds every configured listener, then accepts until `shutdown` reports
    /// a count of at least 1 (stop accepting, drain in-flight workers) or at
    /// least 2 while draining (force return immediately). Spec.md §4.9/§6.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<u32>) -> ProxyResult<()> {
        let mut listeners = Vec::new();
        for spec in &self.config.listeners {
            let (host, port) = spec.bind_addr();
            let bind_host = if self.config.gateway_mode { "0.0.0.0".to_string() } else { host };
            let listener = TcpListener::bind((bind_host.as_str(), port))
                .await
                .map_err(|e| ProxyError::fatal(format!("binding listener {bind_host}:{port}: {e}")))?;
            info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), kind = ?spec_kind(spec), "listening");
            listeners.push((listener, spec.clone()));
        }

        let workers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let mut accept_tasks = JoinSet::new();
        for (listener, spec) in listeners {
            let this = self.clone();
            let shutdown = shutdown.clone();
            let workers = workers.clone();
            accept_tasks.spawn(async move { this.accept_loop(listener, spec, shutdown, workers).await });
        }
        while let Some(result) = accept_tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "listener accept loop panicked");
            }
        }

        let drained = {
            let mut guard = workers.lock().expect("worker list mutex poisoned");
            std::mem::take(&mut *guard)
        };
        info!(workers = drained.len(), "draining in-flight workers");

        let mut remaining = JoinSet::new();
        for handle in drained {
            remaining.spawn(async move { handle.await });
        }

        loop {
            tokio::select! {
                result = remaining.join_next(), if !remaining.is_empty() => {
                    match result {
                        Some(Ok(Err(e))) => warn!(error = %e, "worker task panicked"),
                        Some(Ok(Ok(()))) | Some(Err(_)) | None => {}
                    }
                }
                changed = shutdown.changed(), if changed.is_ok() && *shutdown.borrow() < 2 => {}
                else => break,
            }
            if *shutdown.borrow() >= 2 {
                warn!("second shutdown signal received, forcing exit without draining remaining workers");
                break;
            }
            if remaining.is_empty() {
                break;
            }
        }

        Ok(())
    }

    /// One listener's accept loop. Every spawned worker's handle is pushed
    /// into the shared list immediately so a concurrent drain in `run` always
    /// sees it, rather than waiting for this loop to return a batch.
    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        spec: ListenerSpec,
        mut shutdown: watch::Receiver<u32>,
        workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let socket = match accepted {
                        Ok((socket, _addr)) => socket,
                        Err(e) => { warn!(error = %e, "accept failed"); continue; }
                    };
                    let this = self.clone();
                    let spec = spec.clone();
                    if this.options.serialize {
                        this.dispatch(socket, spec).await;
                    } else {
                        let handle = tokio::spawn(async move { this.dispatch(socket, spec).await });
                        workers.lock().expect("worker list mutex poisoned").push(handle);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() >= 1 {
                        break;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, socket: TcpStream, spec: ListenerSpec) {
        match spec {
            ListenerSpec::Proxy { .. } => run_proxy_client(self.forwarder.clone(), socket).await,
            ListenerSpec::Socks5 { .. } => {
                if let Err(e) = self.socks5.handle(socket).await {
                    warn!(error = %e, "SOCKS5 connection ended with an error");
                }
            }
            ListenerSpec::Tunnel { target_host, target_port, .. } => {
                run_fixed_tunnel(self.forwarder.clone(), socket, target_host, target_port).await
            }
        }
    }
}

fn spec_kind(spec: &ListenerSpec) -> &'static str {
    match spec {
        ListenerSpec::Proxy { .. } => "proxy",
        ListenerSpec::Socks5 { .. } => "socks5",
        ListenerSpec::Tunnel { .. } => "tunnel",
    }
}

/// Drives one HTTP proxy client connection: reads requests off it in a loop,
/// forwards each through C6, and either loops for the next request, upgrades
/// to a splice (CONNECT), or closes on error — matching the worker lifecycle
/// spec.md §4.9/§5 describes ("one worker per connection").
async fn run_proxy_client(forwarder: Arc<RequestForwarder>, socket: TcpStream) {
    let (read_half, write_half) = socket.into_split();
    let mut reader = tokio::io::BufReader::new(read_half);
    let mut writer = write_half;

    loop {
        let request = match read_request_head(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "malformed request head from client, closing connection");
                break;
            }
        };

        match forwarder.handle(&mut reader, &mut writer, &request).await {
            Ok(ForwardOutcome::Done { keep_alive }) => {
                if !keep_alive {
                    break;
                }
            }
            Ok(ForwardOutcome::Upgrade { upstream }) => {
                match reader.into_inner().reunite(writer) {
                    Ok(client) => {
                        if let Err(e) = tunnel::splice(client, upstream).await {
                            warn!(error = %e, "tunnel splice ended with an error");
                        }
                    }
                    Err(_) => warn!("CONNECT socket halves came from different connections"),
                }
                break;
            }
            Err(e) => {
                warn!(error = %e, "request forwarding failed");
                let _ = write_response_head(&mut writer, &synthetic_error_response(&e)).await;
                break;
            }
        }
    }
}

/// Drives a fixed-target tunnel listener (`-L [host:]port:target_host:target_port`):
/// every accepted connection is spliced straight to the same configured
/// target, with no protocol of its own spoken on the listening side.
/// Grounded on `original_source/main.c`'s `tunnel_thread`.
async fn run_fixed_tunnel(forwarder: Arc<RequestForwarder>, socket: TcpStream, target_host: String, target_port: u16) {
    let connect_request = crate::http::HttpRequest::new("CONNECT", format!("{target_host}:{target_port}"), "HTTP/1.1");
    let mut empty = tokio::io::BufReader::new(tokio::io::empty());
    let mut sink = tokio::io::sink();

    match forwarder.handle(&mut empty, &mut sink, &connect_request).await {
        Ok(ForwardOutcome::Upgrade { upstream }) => {
            if let Err(e) = tunnel::splice(socket, upstream).await {
                warn!(error = %e, target = %connect_request.target, "fixed tunnel splice ended with an error");
            }
        }
        Ok(ForwardOutcome::Done { .. }) => {
            warn!(target = %connect_request.target, "fixed tunnel target refused the CONNECT");
        }
        Err(e) => warn!(error = %e, target = %connect_request.target, "fixed tunnel connect failed"),
    }
}

/// Maps an error that escaped the forwarder into the client-visible response
/// spec.md §7 specifies. Best-effort: if the connection already has bytes of
/// a prior response written to it this will corrupt the stream, but the
/// worker closes the socket immediately after either way.
fn synthetic_error_response(error: &ProxyError) -> HttpResponse {
    let (status, reason) = match error {
        ProxyError::AuthDenied(_) => (407, "Proxy Authentication Required"),
        ProxyError::NtlmBadChallenge(_) => (502, "Bad Gateway"),
        ProxyError::HttpMalformed(_) => (502, "Bad Gateway"),
        ProxyError::UpstreamExhausted(_) => (502, "Bad Gateway"),
        ProxyError::ProtocolViolation(_) => (502, "Bad Gateway"),
        ProxyError::PolicyDenied(_) => (403, "Forbidden"),
        ProxyError::Transport(_) => (502, "Bad Gateway"),
        ProxyError::Fatal(_) => (500, "Internal Server Error"),
    };
    let mut response = HttpResponse::new("HTTP/1.1", status, reason);
    response.headers.set("Connection", "close");
    response.headers.set("Content-Length", "0");
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_error_response_maps_auth_denied_to_407() {
        let response = synthetic_error_response(&ProxyError::auth_denied("upstream said no"));
        assert_eq!(response.status, 407);
    }

    #[test]
    fn synthetic_error_response_maps_upstream_exhausted_to_502() {
        let response = synthetic_error_response(&ProxyError::upstream_exhausted("no candidates left"));
        assert_eq!(response.status, 502);
    }
}
