//! Parent proxy descriptors and the failover list cntlm calls its "parent
//! list" (`original_source/main.c`'s `parent_add`/global `parent_list`).

use std::fmt;

/// One candidate upstream (parent) proxy. `fingerprint` is the pool key:
/// two descriptors that would dial the same place share idle connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamDescriptor {
    pub host: String,
    pub port: u16,
}

impl UpstreamDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    pub fn fingerprint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for UpstreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An ordered list of upstreams tried in turn on connect failure (spec.md
/// §4.4's "failover across configured upstreams"), mirroring cntlm's
/// round-robin-on-failure behavior over its `parent_list`.
#[derive(Debug, Clone, Default)]
pub struct UpstreamList {
    upstreams: Vec<UpstreamDescriptor>,
}

impl UpstreamList {
    pub fn new(upstreams: Vec<UpstreamDescriptor>) -> Self {
        Self { upstreams }
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpstreamDescriptor> {
        self.upstreams.iter()
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_combines_host_and_port() {
        let u = UpstreamDescriptor::new("proxy.corp.example", 3128);
        assert_eq!(u.fingerprint(), "proxy.corp.example:3128");
    }

    #[test]
    fn upstream_list_preserves_configured_order() {
        let list = UpstreamList::new(vec![UpstreamDescriptor::new("a", 1), UpstreamDescriptor::new("b", 2)]);
        let hosts: Vec<&str> = list.iter().map(|u| u.host.as_str()).collect();
        assert_eq!(hosts, vec!["a", "b"]);
    }
}
