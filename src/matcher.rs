//! Address match rules.
//!
//! Gate and auth selection is driven by `kind:pattern` rules compiled into
//! predicates over address strings. Three kinds are built in:
//!
//! | kind     | priority | matches |
//! |----------|---------:|---------|
//! | `plain`  |      100 | exact string equality |
//! | `regexp` |       50 | unanchored regular-expression search |
//! | `ipnet`  |        0 | the address (port stripped) parses as an IP inside the CIDR |
//!
//! A rule without a `:` is a `plain` rule. Higher priority wins; rules of
//! equal priority have no defined order. Additional kinds can be registered
//! on a [`MatcherRegistry`], including the process-wide default obtained
//! from [`registry()`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Compiled predicate over address strings.
pub type Matcher = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Builds a [`Matcher`] from the pattern half of a `kind:pattern` rule.
pub type MatcherBuilder = Arc<dyn Fn(&str) -> Result<Matcher> + Send + Sync>;

pub const PRIORITY_PLAIN: i32 = 100;
pub const PRIORITY_REGEXP: i32 = 50;
pub const PRIORITY_IPNET: i32 = 0;

/// Registry of named rule kinds with priorities.
///
/// Reads (rule compilation) take a shared lock; registration and priority
/// resets take the exclusive lock.
pub struct MatcherRegistry {
    builders: RwLock<HashMap<String, (MatcherBuilder, i32)>>,
}

impl MatcherRegistry {
    /// An empty registry with no kinds at all.
    pub fn empty() -> Self {
        MatcherRegistry {
            builders: RwLock::new(HashMap::new()),
        }
    }

    /// A registry preloaded with the built-in kinds.
    pub fn new() -> Self {
        let reg = Self::empty();
        reg.register("plain", Arc::new(|p| match_plain(p)), PRIORITY_PLAIN);
        reg.register("regexp", Arc::new(|p| match_regexp(p)), PRIORITY_REGEXP);
        reg.register("ipnet", Arc::new(|p| match_ipnet(p)), PRIORITY_IPNET);
        reg
    }

    /// Registers (or replaces) a rule kind. Returns whether a kind of that
    /// name already existed.
    pub fn register(&self, name: &str, builder: MatcherBuilder, priority: i32) -> bool {
        let mut builders = self.builders.write();
        builders
            .insert(name.to_string(), (builder, priority))
            .is_some()
    }

    /// Changes the priority of an existing kind. Unknown names are ignored;
    /// returns whether the kind existed.
    pub fn reset_priority(&self, name: &str, priority: i32) -> bool {
        let mut builders = self.builders.write();
        match builders.get_mut(name) {
            Some(entry) => {
                entry.1 = priority;
                true
            }
            None => false,
        }
    }

    /// Splits a rule into `(kind, pattern)`. Without a `:` the kind is
    /// `plain` and the whole rule is the pattern.
    pub fn split(rule: &str) -> (&str, &str) {
        match rule.split_once(':') {
            Some((kind, pattern)) => (kind, pattern),
            None => ("plain", rule),
        }
    }

    /// Compiles a `kind:pattern` rule into a matcher and its priority.
    pub fn build(&self, rule: &str) -> Result<(Matcher, i32)> {
        let (kind, pattern) = Self::split(rule);
        let (builder, priority) = {
            let builders = self.builders.read();
            match builders.get(kind) {
                Some((b, p)) => (b.clone(), *p),
                None => return Err(Error::UnknownRuleKind(kind.to_string())),
            }
        };
        let matcher = builder(pattern)?;
        Ok((matcher, priority))
    }
}

impl Default for MatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: Lazy<MatcherRegistry> = Lazy::new(MatcherRegistry::new);

/// The process-wide registry used by [`crate::Mux`].
pub fn registry() -> &'static MatcherRegistry {
    &REGISTRY
}

/// Exact string equality.
pub fn match_plain(pattern: &str) -> Result<Matcher> {
    let want = pattern.to_string();
    Ok(Arc::new(move |addr| addr == want))
}

/// Unanchored regular-expression search.
pub fn match_regexp(pattern: &str) -> Result<Matcher> {
    let re = regex::Regex::new(pattern).map_err(|e| Error::BadPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;
    Ok(Arc::new(move |addr| re.is_match(addr)))
}

/// CIDR containment. Accepts a bare IP or `host:port` (the port is
/// stripped); hosts that do not parse as an IP never match. Bare IPv6
/// literals and bracketed `[v6]:port` forms are not recognised.
pub fn match_ipnet(pattern: &str) -> Result<Matcher> {
    let net: ipnet::IpNet = pattern.parse().map_err(|e: ipnet::AddrParseError| {
        Error::BadPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        }
    })?;
    Ok(Arc::new(move |addr| {
        let host = match addr.rsplit_once(':') {
            Some((host, _port)) if !host.is_empty() => host,
            Some(_) => return false,
            None => addr,
        };
        match host.parse::<IpAddr>() {
            Ok(ip) => net.contains(&ip),
            Err(_) => false,
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_defaults_to_plain() {
        assert_eq!(MatcherRegistry::split("plain:10.0.0.1:22"), ("plain", "10.0.0.1:22"));
        assert_eq!(MatcherRegistry::split("regexp:.*"), ("regexp", ".*"));
        assert_eq!(MatcherRegistry::split("hostname"), ("plain", "hostname"));
    }

    #[test]
    fn plain_is_exact() {
        let (m, priority) = registry().build("plain:127.0.0.1:22").unwrap();
        assert_eq!(priority, PRIORITY_PLAIN);
        assert!(m("127.0.0.1:22"));
        assert!(!m("127.0.0.1"));
        assert!(!m("127.0.0.1:2222"));
    }

    #[test]
    fn regexp_searches_unanchored() {
        let m = match_regexp(r"127\.0\.\d{1,3}\.\d{1,3}").unwrap();
        let cases = [
            ("127.0.0.1", true),
            ("127.0.1.1", true),
            ("127.0.11.1", true),
            ("127.0.111.1", true),
            ("127.0.0.11", true),
            ("127.0.0.111", true),
            ("127.0.0a1", false),
            ("127.0.011", false),
        ];
        for (addr, want) in cases {
            assert_eq!(m(addr), want, "regexp match {:?}", addr);
        }
    }

    #[test]
    fn ipnet_with_and_without_port() {
        let m = match_ipnet("127.0.0.0/16").unwrap();
        let cases = [
            ("127.0.0.1", true),
            ("127.0.1.1", true),
            ("127.0.11.1", true),
            ("127.0.111.1", true),
            ("127.0.0.11", true),
            ("127.0.0.111", true),
            ("127.0.0a1", false),
            ("127.0.011", false),
            ("127.1.2.3:22", false),
            ("127.0.2.3:22", true),
        ];
        for (addr, want) in cases {
            assert_eq!(m(addr), want, "ipnet match {:?}", addr);
        }
    }

    #[test]
    fn ipnet_rejects_bad_cidr() {
        assert!(matches!(
            match_ipnet("not-a-cidr"),
            Err(Error::BadPattern { .. })
        ));
    }

    #[test]
    fn unknown_kind_errors() {
        // A raw host:port key parses its host part as the kind.
        assert!(matches!(
            registry().build("127.0.0.1:22"),
            Err(Error::UnknownRuleKind(k)) if k == "127.0.0.1"
        ));
    }

    #[test]
    fn register_replace_and_reset() {
        let reg = MatcherRegistry::new();
        let replaced = reg.register(
            "always",
            Arc::new(|_| Ok(Arc::new(|_: &str| true) as Matcher)),
            7,
        );
        assert!(!replaced);
        let (m, priority) = reg.build("always:whatever").unwrap();
        assert!(m("anything"));
        assert_eq!(priority, 7);

        assert!(reg.register(
            "always",
            Arc::new(|_| Ok(Arc::new(|_: &str| false) as Matcher)),
            7,
        ));
        let (m, _) = reg.build("always:whatever").unwrap();
        assert!(!m("anything"));

        assert!(reg.reset_priority("always", -3));
        let (_, priority) = reg.build("always:x").unwrap();
        assert_eq!(priority, -3);
        assert!(!reg.reset_priority("missing", 1));
    }
}
