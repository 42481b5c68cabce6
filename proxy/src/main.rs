//! Binary entry point (spec.md §6, SPEC_FULL.md's ambient-stack section):
//! loads an optional TOML config file, falls back to environment variables
//! the way the teacher's `smb/src/main.rs` reads `SMB_PORT`, wires the
//! result into a [`ProxyConfig`], then drives the C10 [`Acceptor`] until
//! SIGINT/SIGTERM/SIGHUP asks for a graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ntlm_proxy::config::{ListenerSpec, ProxyConfig, ProxyConfigBuilder, RequestLogLevel, ScannerPluginConfig, Socks5UserTable};
use ntlm_proxy::credential::{AuthPolicy, Credential};
use ntlm_proxy::server::{Acceptor, AcceptorOptions};
use ntlm_proxy::upstream::{UpstreamDescriptor, UpstreamList};
use proxy_core::containers::GlobSet;
use proxy_core::{ProxyError, ProxyResult};

/// The on-disk shape of the config file, field names chosen to match
/// `original_source/main.c`'s `cntlm.conf` keys (`Username`, `Domain`,
/// `PassNTLMv2`, `NoProxy`, `SOCKS5Users`, ...) translated to TOML's
/// `snake_case` convention instead of reusing the original's CamelCase.
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    username: Option<String>,
    domain: Option<String>,
    workstation: Option<String>,
    password: Option<String>,
    pass_lm: Option<String>,
    pass_nt: Option<String>,
    pass_ntlmv2: Option<String>,
    #[serde(default)]
    auth: AuthConfig,
    /// Manual override of the Type-1 negotiate flags (`Flags` in cntlm.conf),
    /// given as a hex string such as `"0x06820000"`.
    flags: Option<String>,
    #[serde(default)]
    listen: Vec<String>,
    #[serde(default)]
    socks5_listen: Vec<String>,
    #[serde(default)]
    tunnel: Vec<String>,
    #[serde(default)]
    upstream: Vec<String>,
    #[serde(default)]
    no_proxy: Vec<String>,
    #[serde(default)]
    socks5_users: Vec<String>,
    #[serde(default)]
    gateway: bool,
    pool_idle_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    request_log_level: Option<String>,
    #[serde(default)]
    scanner_plugin: ScannerPluginFileConfig,
}

#[derive(Debug, Deserialize, Default)]
struct AuthConfig {
    #[serde(default)]
    hashlm: bool,
    #[serde(default)]
    hashnt: bool,
    #[serde(default)]
    hashntlm2: bool,
    #[serde(default)]
    ntlm_to_basic: bool,
}

impl From<AuthConfig> for AuthPolicy {
    fn from(value: AuthConfig) -> Self {
        AuthPolicy { hashlm: value.hashlm, hashnt: value.hashnt, hashntlm2: value.hashntlm2, ntlm_to_basic: value.ntlm_to_basic }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ScannerPluginFileConfig {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    user_agent_globs: Vec<String>,
    max_follow_size_kib: Option<u64>,
}

#[tokio::main]
async fn main() -> ProxyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match load_config() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(listeners = config.listeners.len(), upstreams = config.upstreams.len(), "ntlm-proxyd starting");

    let acceptor = Arc::new(Acceptor::new(config, AcceptorOptions::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(0u32);

    tokio::spawn(watch_signals(shutdown_tx));

    if let Err(e) = acceptor.run(shutdown_rx).await {
        error!(error = %e, "acceptor exited with an error");
        std::process::exit(1);
    }

    info!("ntlm-proxyd shut down cleanly");
    Ok(())
}

/// SIGHUP is wired to the same graceful-shutdown path as SIGINT/SIGTERM
/// (SPEC_FULL.md supplement over spec.md §6, which only names the latter
/// two) — this daemon has no config-reload behavior to give SIGHUP its
/// traditional meaning. Each received signal increments the count `Acceptor`
/// watches: first signal drains, second forces exit.
async fn watch_signals(shutdown_tx: watch::Sender<u32>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGHUP handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sighup.recv() => info!("received SIGHUP"),
        }
        let count = *shutdown_tx.borrow() + 1;
        let _ = shutdown_tx.send(count);
        if count >= 2 {
            break;
        }
    }
}

/// Reads `NTLM_PROXY_CONFIG` for a TOML file path (default `cntlm.toml` in
/// the working directory, silently skipped if absent), then fills in
/// anything the file didn't set from environment variables, the way the
/// teacher's `main.rs` reads `SMB_PORT` directly.
fn load_config() -> ProxyResult<ProxyConfig> {
    let path = std::env::var("NTLM_PROXY_CONFIG").unwrap_or_else(|_| "cntlm.toml".to_string());
    let file = match std::fs::read_to_string(&path) {
        Ok(contents) => toml::from_str(&contents).map_err(|e| ProxyError::fatal(format!("parsing {path}: {e}")))?,
        Err(_) => FileConfig::default(),
    };

    let username = file.username.or_else(|| std::env::var("NTLM_PROXY_USERNAME").ok()).ok_or_else(|| {
        ProxyError::fatal("no Username configured (set it in the config file or NTLM_PROXY_USERNAME)")
    })?;
    let domain = file.domain.or_else(|| std::env::var("NTLM_PROXY_DOMAIN").ok()).unwrap_or_default();
    let workstation = file
        .workstation
        .or_else(|| std::env::var("NTLM_PROXY_WORKSTATION").ok())
        .unwrap_or_else(|| "cntlm".to_string());

    let policy: AuthPolicy = file.auth.into();
    let manual_flags = file
        .flags
        .as_deref()
        .map(|s| {
            let trimmed = s.trim_start_matches("0x");
            u32::from_str_radix(trimmed, 16).map_err(|_| ProxyError::fatal(format!("Flags value '{s}' is not valid hex")))
        })
        .transpose()?;

    let password = file.password.or_else(|| std::env::var("NTLM_PROXY_PASSWORD").ok());
    let credential = if let Some(password) = password {
        Credential::from_password(username, domain, workstation, policy, password, manual_flags)
    } else {
        let pass_lm = parse_hash(file.pass_lm.as_deref())?;
        let pass_nt = parse_hash(file.pass_nt.as_deref())?;
        let pass_ntlmv2 = parse_hash(file.pass_ntlmv2.as_deref())?;
        Credential::from_hashes(username, domain, workstation, policy, pass_lm, pass_nt, pass_ntlmv2, manual_flags)
    };
    credential.require_usable()?;

    let mut listeners = Vec::new();
    for entry in &file.listen {
        listeners.push(parse_proxy_listener(entry)?);
    }
    for entry in &file.socks5_listen {
        listeners.push(parse_socks5_listener(entry)?);
    }
    for entry in &file.tunnel {
        listeners.push(parse_tunnel_listener(entry)?);
    }
    if listeners.is_empty() {
        listeners.push(ListenerSpec::Proxy { bind_host: "127.0.0.1".to_string(), bind_port: 3128 });
    }

    let mut upstreams = Vec::new();
    for entry in &file.upstream {
        upstreams.push(parse_host_port(entry, "Proxy")?);
    }

    let mut socks5_users = Vec::new();
    for entry in &file.socks5_users {
        let (user, pass) = entry
            .split_once(':')
            .ok_or_else(|| ProxyError::fatal(format!("SOCKS5User '{entry}' is not user:password")))?;
        socks5_users.push((user.to_string(), pass.to_string()));
    }

    let request_log_level = match file.request_log_level.as_deref() {
        None => RequestLogLevel::Normal,
        Some("quiet") => RequestLogLevel::Quiet,
        Some("normal") => RequestLogLevel::Normal,
        Some("verbose") => RequestLogLevel::Verbose,
        Some(other) => return Err(ProxyError::fatal(format!("unknown request_log_level '{other}'"))),
    };

    let scanner_plugin = ScannerPluginConfig {
        enabled: file.scanner_plugin.enabled,
        user_agent_globs: GlobSet::new(file.scanner_plugin.user_agent_globs),
        max_follow_size_kib: file.scanner_plugin.max_follow_size_kib.unwrap_or(512),
    };

    ProxyConfigBuilder::default()
        .credential(credential)
        .upstreams(UpstreamList::new(upstreams))
        .listeners(listeners)
        .no_proxy(GlobSet::new(file.no_proxy))
        .socks5_users(Socks5UserTable::new(socks5_users))
        .scanner_plugin(scanner_plugin)
        .pool_idle_timeout(Duration::from_secs(file.pool_idle_timeout_secs.unwrap_or(300)))
        .connect_timeout(Duration::from_secs(file.connect_timeout_secs.unwrap_or(10)))
        .gateway_mode(file.gateway)
        .request_log_level(request_log_level)
        .build()
        .map_err(|e| ProxyError::fatal(format!("assembling configuration: {e}")))
}

fn parse_hash(hex_str: Option<&str>) -> ProxyResult<Option<[u8; 16]>> {
    let Some(hex_str) = hex_str else { return Ok(None) };
    if hex_str.is_empty() {
        return Ok(None);
    }
    let bytes = hex::decode(hex_str).map_err(|_| ProxyError::fatal(format!("hash '{hex_str}' is not valid hex")))?;
    let array: [u8; 16] = bytes
        .try_into()
        .map_err(|_| ProxyError::fatal("precomputed hash must be exactly 16 bytes"))?;
    Ok(Some(array))
}

/// `[host:]port`, defaulting the host to loopback unless gateway mode is set
/// at the listener's own call site (gateway mode is applied uniformly in
/// [`Acceptor::run`], so only the port matters here).
fn parse_proxy_listener(entry: &str) -> ProxyResult<ListenerSpec> {
    let (host, port) = parse_bind(entry)?;
    Ok(ListenerSpec::Proxy { bind_host: host, bind_port: port })
}

fn parse_socks5_listener(entry: &str) -> ProxyResult<ListenerSpec> {
    let (host, port) = parse_bind(entry)?;
    Ok(ListenerSpec::Socks5 { bind_host: host, bind_port: port })
}

/// `[host:]port:target_host:target_port`, matching `original_source/main.c`'s
/// `-L` tunnel syntax.
fn parse_tunnel_listener(entry: &str) -> ProxyResult<ListenerSpec> {
    let parts: Vec<&str> = entry.split(':').collect();
    let (bind_part, target_host, target_port) = match parts.as_slice() {
        [bind, target_host, target_port] => (bind.to_string(), target_host.to_string(), *target_port),
        [bind_host, bind_port, target_host, target_port] => (format!("{bind_host}:{bind_port}"), target_host.to_string(), *target_port),
        _ => return Err(ProxyError::fatal(format!("tunnel entry '{entry}' is not [host:]port:target_host:target_port"))),
    };
    let (bind_host, bind_port) = parse_bind(&bind_part)?;
    let target_port: u16 = target_port
        .parse()
        .map_err(|_| ProxyError::fatal(format!("tunnel target port '{target_port}' is not numeric")))?;
    Ok(ListenerSpec::Tunnel { bind_host, bind_port, target_host, target_port })
}

fn parse_bind(entry: &str) -> ProxyResult<(String, u16)> {
    match entry.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().map_err(|_| ProxyError::fatal(format!("bind port '{port}' is not numeric")))?;
            Ok((host.to_string(), port))
        }
        None => {
            let port: u16 = entry.parse().map_err(|_| ProxyError::fatal(format!("bind entry '{entry}' is not [host:]port")))?;
            Ok(("127.0.0.1".to_string(), port))
        }
    }
}

fn parse_host_port(entry: &str, label: &str) -> ProxyResult<UpstreamDescriptor> {
    let (host, port) = entry
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::fatal(format!("{label} entry '{entry}' is not host:port")))?;
    let port: u16 = port.parse().map_err(|_| ProxyError::fatal(format!("{label} port '{port}' is not numeric")))?;
    Ok(UpstreamDescriptor::new(host, port))
}
