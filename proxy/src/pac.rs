//! PAC evaluator interface (spec.md §6): the core never evaluates a PAC
//! script itself (out of scope, spec.md §1) — it only calls back into an
//! already-initialized evaluator supplied at configuration time, the same
//! arrangement `original_source/main.c` uses for `pacparser_find_proxy`
//! behind `pacparser_mtx`.

use proxy_core::ProxyResult;

/// One entry of a PAC `FindProxyForURL` result, already split into a kind and
/// an address (the core never re-parses the raw `"PROXY host:port"` string).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacResult {
    pub kind: PacResultKind,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacResultKind {
    Proxy,
    Direct,
}

/// Implemented by the external PAC-script collaborator. `find_proxy` is
/// synchronous because pacparser's C library is not reentrant — the forwarder
/// serializes calls through a single lock (spec.md §6: "Calls into this
/// evaluator are serialized").
pub trait PacEvaluator: Send + Sync {
    fn find_proxy(&self, url: &str, host: &str) -> ProxyResult<Vec<PacResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysDirect;
    impl PacEvaluator for AlwaysDirect {
        fn find_proxy(&self, _url: &str, _host: &str) -> ProxyResult<Vec<PacResult>> {
            Ok(vec![PacResult { kind: PacResultKind::Direct, host: String::new(), port: 0 }])
        }
    }

    #[test]
    fn evaluator_trait_object_is_callable() {
        let evaluator: Box<dyn PacEvaluator> = Box::new(AlwaysDirect);
        let result = evaluator.find_proxy("http://example.com/", "example.com").unwrap();
        assert_eq!(result[0].kind, PacResultKind::Direct);
    }
}
