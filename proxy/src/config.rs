//! The already-parsed configuration object the core consumes (spec.md §6).
//! Grounded on the teacher's `SMBServer`/`SMBServerBuilder` (`derive_builder`,
//! `#[builder(default = "...")]` per field) for the builder shape, narrowed
//! to the fields this daemon actually reads.

use std::sync::Arc;
use std::time::Duration;

use derive_builder::Builder;
use proxy_core::containers::{AssocList, GlobSet};

use crate::credential::{AuthPolicy, Credential};
use crate::pac::PacEvaluator;
use crate::upstream::UpstreamList;

/// `[host:]port` proxy/SOCKS5 listeners, or a fixed-target tunnel listener
/// (`-L [host:]port:target_host:target_port`).
#[derive(Debug, Clone)]
pub enum ListenerSpec {
    Proxy { bind_host: String, bind_port: u16 },
    Socks5 { bind_host: String, bind_port: u16 },
    Tunnel { bind_host: String, bind_port: u16, target_host: String, target_port: u16 },
}

impl ListenerSpec {
    pub fn bind_addr(&self) -> (String, u16) {
        match self {
            ListenerSpec::Proxy { bind_host, bind_port } => (bind_host.clone(), *bind_port),
            ListenerSpec::Socks5 { bind_host, bind_port } => (bind_host.clone(), *bind_port),
            ListenerSpec::Tunnel { bind_host, bind_port, .. } => (bind_host.clone(), *bind_port),
        }
    }
}

/// `alice: s3cret` entries for the SOCKS5 username/password method
/// (spec.md §4.8). Stored in cleartext at rest because the wire protocol
/// itself carries the password in cleartext (RFC 1929) — there is nothing
/// further to protect once the proxy holds it.
#[derive(Debug, Clone, Default)]
pub struct Socks5UserTable {
    entries: Vec<(String, String)>,
}

impl Socks5UserTable {
    pub fn new(entries: Vec<(String, String)>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn check(&self, username: &[u8], password: &[u8]) -> bool {
        self.entries.iter().any(|(u, p)| {
            proxy_core::containers::constant_time_eq(u.as_bytes(), username)
                && proxy_core::containers::constant_time_eq(p.as_bytes(), password)
        })
    }
}

/// Scanner-plugin compatibility shim settings (spec.md §4.5, §9 open
/// question — opt-in only, never enabled unless configured).
#[derive(Debug, Clone)]
pub struct ScannerPluginConfig {
    pub enabled: bool,
    pub user_agent_globs: GlobSet,
    pub max_follow_size_kib: u64,
}

impl Default for ScannerPluginConfig {
    fn default() -> Self {
        Self { enabled: false, user_agent_globs: GlobSet::new(Vec::new()), max_follow_size_kib: 512 }
    }
}

#[derive(Builder)]
#[builder(pattern = "owned")]
pub struct ProxyConfig {
    pub credential: Credential,

    #[builder(default)]
    pub upstreams: UpstreamList,

    pub listeners: Vec<ListenerSpec>,

    #[builder(default)]
    pub no_proxy: GlobSet,

    #[builder(default)]
    pub header_substitutions: AssocList,

    #[builder(default)]
    pub socks5_users: Socks5UserTable,

    #[builder(default)]
    pub scanner_plugin: ScannerPluginConfig,

    #[builder(default = "Duration::from_secs(300)")]
    pub pool_idle_timeout: Duration,

    #[builder(default = "Duration::from_secs(10)")]
    pub connect_timeout: Duration,

    #[builder(default = "usize::try_from(1024 * 1024).unwrap()")]
    pub body_buffer_threshold_bytes: usize,

    /// `-g`/gateway mode: bind listeners to all interfaces instead of loopback.
    #[builder(default = "false")]
    pub gateway_mode: bool,

    /// cntlm's request logging level (`-q` quiets it); kept as a verbosity
    /// knob independent of the `tracing` filter so operators can dial proxy
    /// access logging without touching the general log level.
    #[builder(default = "RequestLogLevel::Normal")]
    pub request_log_level: RequestLogLevel,

    #[builder(default)]
    pub pac_evaluator: Option<Arc<dyn PacEvaluator>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestLogLevel {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

impl ProxyConfig {
    pub fn auth_policy(&self) -> AuthPolicy {
        self.credential.policy()
    }
}

/// Hand-written because `PacEvaluator` trait objects carry no `Debug` impl
/// of their own; every other field is printed normally.
impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("credential", &self.credential)
            .field("upstreams", &self.upstreams)
            .field("listeners", &self.listeners)
            .field("no_proxy", &self.no_proxy)
            .field("header_substitutions", &self.header_substitutions)
            .field("socks5_users", &self.socks5_users)
            .field("scanner_plugin", &self.scanner_plugin)
            .field("pool_idle_timeout", &self.pool_idle_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("body_buffer_threshold_bytes", &self.body_buffer_threshold_bytes)
            .field("gateway_mode", &self.gateway_mode)
            .field("request_log_level", &self.request_log_level)
            .field("pac_evaluator", &self.pac_evaluator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks5_user_table_rejects_wrong_password() {
        let table = Socks5UserTable::new(vec![("alice".into(), "s3cret".into())]);
        assert!(table.check(b"alice", b"s3cret"));
        assert!(!table.check(b"alice", b"wrong"));
        assert!(!table.check(b"bob", b"s3cret"));
    }

    #[test]
    fn listener_spec_exposes_bind_address() {
        let spec = ListenerSpec::Tunnel {
            bind_host: "127.0.0.1".into(),
            bind_port: 9000,
            target_host: "internal.example".into(),
            target_port: 443,
        };
        assert_eq!(spec.bind_addr(), ("127.0.0.1".into(), 9000));
    }
}
