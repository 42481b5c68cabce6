//! Small containers: an order-preserving, duplicate-permitting association
//! list (used for HTTP headers) and a glob pattern set (used for the
//! no-proxy list). Kept deliberately simple — this traffic is never large
//! enough to need a hash map, and insertion order is an observable part of
//! the wire format for headers.

/// An ordered list of `(name, value)` pairs. Lookups by name are
/// case-insensitive; insertion order and duplicate names are preserved,
/// matching HTTP's own header semantics (spec.md §4.1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssocList {
    entries: Vec<(String, String)>,
}

impl AssocList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove every entry whose name matches, case-insensitive. Used to strip
    /// hop-by-hop headers before forwarding (spec.md §4.5).
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Insert or replace: removes any existing entries for `name` then pushes
    /// the new value, used for header substitutions (spec.md §6).
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.push(name, value);
    }
}

/// An ordered set of glob patterns matched against a hostname (the no-proxy
/// list, spec.md §3). Grounded on `original_source/main.c`'s `noproxy_match`,
/// which feeds each candidate through `fnmatch(pattern, addr, 0)` in list
/// order and accepts on the first hit.
#[derive(Debug, Clone, Default)]
pub struct GlobSet {
    patterns: Vec<String>,
}

impl GlobSet {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.patterns.iter().any(|p| glob_match(p, candidate))
    }
}

/// Minimal shell-glob matcher (`*` and `?`), case-insensitive, with no other
/// `fnmatch` extensions (no character classes, no brace expansion) — cntlm's
/// NoProxy patterns never use more than this.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().map(|c| c.to_ascii_lowercase()).collect();
    let candidate: Vec<char> = candidate.chars().map(|c| c.to_ascii_lowercase()).collect();
    glob_match_inner(&pattern, &candidate)
}

fn glob_match_inner(pattern: &[char], candidate: &[char]) -> bool {
    match pattern.first() {
        None => candidate.is_empty(),
        Some('*') => {
            glob_match_inner(&pattern[1..], candidate)
                || (!candidate.is_empty() && glob_match_inner(pattern, &candidate[1..]))
        }
        Some('?') => !candidate.is_empty() && glob_match_inner(&pattern[1..], &candidate[1..]),
        Some(c) => candidate.first() == Some(c) && glob_match_inner(&pattern[1..], &candidate[1..]),
    }
}

/// Constant-time byte comparison, preferred over `==` for credential checks
/// (spec.md §4.8: "constant-time compare is preferred").
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assoc_list_preserves_order_and_duplicates() {
        let mut list = AssocList::new();
        list.push("Host", "example.com");
        list.push("X-Trace", "1");
        list.push("X-Trace", "2");
        assert_eq!(list.get_all("x-trace").collect::<Vec<_>>(), vec!["1", "2"]);
        assert_eq!(list.get("HOST"), Some("example.com"));
    }

    #[test]
    fn assoc_list_set_replaces_all_prior_values() {
        let mut list = AssocList::new();
        list.push("Connection", "keep-alive");
        list.push("Connection", "upgrade");
        list.set("Connection", "close");
        assert_eq!(list.get_all("connection").collect::<Vec<_>>(), vec!["close"]);
    }

    #[test]
    fn glob_matches_star_and_question_mark() {
        let set = GlobSet::new(vec!["*.local".into(), "10.0.0.?".into()]);
        assert!(set.matches("host.local"));
        assert!(set.matches("10.0.0.5"));
        assert!(!set.matches("10.0.0.55"));
        assert!(!set.matches("example.com"));
    }

    #[test]
    fn constant_time_eq_rejects_mismatched_lengths_and_bytes() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
    }
}
