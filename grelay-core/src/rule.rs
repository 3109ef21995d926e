//! # Rule Engine
//!
//! This module decides where a call the server does not implement should be forwarded to.
//!
//! A [`Rule`] holds three ordered lists of patterns, each pattern carrying one or more candidate
//! backend addresses:
//!
//! 1. **[`IpPattern`]**: the caller's IP address falls inside one of the CIDR networks.
//! 2. **[`PathPattern`]**: one of the regular expressions matches the method path
//!    (`/package.Service/Method`). Expressions are searched, not anchored, unless they say so.
//! 3. **[`HeaderPattern`]**: every required metadata key is present with the required value.
//!
//! Lists are evaluated in that order and, inside a list, in declaration order. The first
//! pattern that matches wins and one of its destinations is picked at random.
//!
//! Entries that cannot be compiled (malformed CIDRs, invalid regular expressions) are skipped
//! with a warning when the pattern is built: they can never match, and they never prevent the
//! remaining entries from being used.
pub mod cidr;

pub use cidr::{Cidr, CidrParseError};

use crate::call::InboundCall;
use rand::{Rng, SeedableRng, rngs::StdRng};
use regex::Regex;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    Ip,
    Path,
    Header,
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternKind::Ip => f.write_str("ip"),
            PatternKind::Path => f.write_str("path"),
            PatternKind::Header => f.write_str("header"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("The {0} based pattern has no destinations")]
    NoDestinations(PatternKind),
}

/// Routes calls by the caller's IP address.
#[derive(Debug, Clone)]
pub struct IpPattern {
    cidrs: Vec<Cidr>,
    dest: Vec<String>,
}

impl IpPattern {
    /// # Arguments
    ///
    /// * `cidrs` - Networks in CIDR notation (e.g. `192.168.0.0/24`). Malformed entries are
    ///   skipped.
    /// * `dest` - Candidate backend addresses (e.g. `10.0.0.5:9000`). Must not be empty.
    pub fn new<C, D>(
        cidrs: impl IntoIterator<Item = C>,
        dest: impl IntoIterator<Item = D>,
    ) -> Result<Self, PatternError>
    where
        C: AsRef<str>,
        D: Into<String>,
    {
        let dest = destinations(PatternKind::Ip, dest)?;

        let cidrs = cidrs
            .into_iter()
            .filter_map(|cidr| match cidr.as_ref().parse::<Cidr>() {
                Ok(cidr) => Some(cidr),
                Err(err) => {
                    warn!("Skipping ip based proxy rule entry: {err}");
                    None
                }
            })
            .collect();

        Ok(Self { cidrs, dest })
    }

    pub fn cidrs(&self) -> &[Cidr] {
        &self.cidrs
    }

    pub fn destinations(&self) -> &[String] {
        &self.dest
    }

    fn matches(&self, ip: IpAddr) -> bool {
        self.cidrs.iter().any(|cidr| cidr.contains(ip))
    }
}

/// Routes calls by their fully qualified method path.
#[derive(Debug, Clone)]
pub struct PathPattern {
    paths: Vec<Regex>,
    dest: Vec<String>,
}

impl PathPattern {
    /// # Arguments
    ///
    /// * `paths` - Regular expressions searched in the method path. Invalid ones are skipped.
    /// * `dest` - Candidate backend addresses. Must not be empty.
    pub fn new<P, D>(
        paths: impl IntoIterator<Item = P>,
        dest: impl IntoIterator<Item = D>,
    ) -> Result<Self, PatternError>
    where
        P: AsRef<str>,
        D: Into<String>,
    {
        let dest = destinations(PatternKind::Path, dest)?;

        let paths = paths
            .into_iter()
            .filter_map(|path| match Regex::new(path.as_ref()) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!(
                        "Skipping path based proxy rule entry '{}': {err}",
                        path.as_ref()
                    );
                    None
                }
            })
            .collect();

        Ok(Self { paths, dest })
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(Regex::as_str)
    }

    pub fn destinations(&self) -> &[String] {
        &self.dest
    }

    fn matches(&self, method: &str) -> bool {
        self.paths.iter().any(|regex| regex.is_match(method))
    }
}

/// Routes calls carrying a set of metadata key/value pairs.
#[derive(Debug, Clone)]
pub struct HeaderPattern {
    headers: Vec<(String, String)>,
    dest: Vec<String>,
}

impl HeaderPattern {
    /// # Arguments
    ///
    /// * `headers` - Required `(key, value)` pairs. Keys are case-insensitive. A pattern without
    ///   pairs never matches.
    /// * `dest` - Candidate backend addresses. Must not be empty.
    pub fn new<K, V, D>(
        headers: impl IntoIterator<Item = (K, V)>,
        dest: impl IntoIterator<Item = D>,
    ) -> Result<Self, PatternError>
    where
        K: AsRef<str>,
        V: Into<String>,
        D: Into<String>,
    {
        let dest = destinations(PatternKind::Header, dest)?;

        let headers = headers
            .into_iter()
            .map(|(key, value)| (key.as_ref().to_ascii_lowercase(), value.into()))
            .collect();

        Ok(Self { headers, dest })
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn destinations(&self) -> &[String] {
        &self.dest
    }

    fn matches(&self, call: &InboundCall<'_>) -> bool {
        !self.headers.is_empty()
            && self
                .headers
                .iter()
                .all(|(key, value)| call.values(key).any(|candidate| candidate == value))
    }
}

fn destinations<D: Into<String>>(
    kind: PatternKind,
    dest: impl IntoIterator<Item = D>,
) -> Result<Vec<String>, PatternError> {
    let dest: Vec<String> = dest.into_iter().map(Into::into).collect();

    if dest.is_empty() {
        return Err(PatternError::NoDestinations(kind));
    }

    Ok(dest)
}

/// The outcome of a successful [`Rule::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route<'a> {
    /// Which list the matching pattern belongs to.
    pub kind: PatternKind,
    /// Position of the matching pattern inside its list.
    pub index: usize,
    /// The backend address picked among the pattern's destinations.
    pub destination: &'a str,
}

/// An immutable set of proxy patterns.
///
/// A `Rule` is built once and then only read, so it can be shared by all concurrent calls.
/// The random source used to pick destinations is the only piece of state behind a lock.
#[derive(Debug)]
pub struct Rule {
    ip_patterns: Vec<IpPattern>,
    path_patterns: Vec<PathPattern>,
    header_patterns: Vec<HeaderPattern>,
    rng: Mutex<StdRng>,
}

impl Default for Rule {
    fn default() -> Self {
        Self::new()
    }
}

impl Rule {
    /// Creates an empty rule set whose random source is seeded from the OS.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Creates an empty rule set with a deterministic random source.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            ip_patterns: Vec::new(),
            path_patterns: Vec::new(),
            header_patterns: Vec::new(),
            rng: Mutex::new(rng),
        }
    }

    pub fn with_ip_patterns(mut self, patterns: impl IntoIterator<Item = IpPattern>) -> Self {
        self.ip_patterns.extend(patterns);
        self
    }

    pub fn with_path_patterns(mut self, patterns: impl IntoIterator<Item = PathPattern>) -> Self {
        self.path_patterns.extend(patterns);
        self
    }

    pub fn with_header_patterns(
        mut self,
        patterns: impl IntoIterator<Item = HeaderPattern>,
    ) -> Self {
        self.header_patterns.extend(patterns);
        self
    }

    pub fn ip_patterns(&self) -> &[IpPattern] {
        &self.ip_patterns
    }

    pub fn path_patterns(&self) -> &[PathPattern] {
        &self.path_patterns
    }

    pub fn header_patterns(&self) -> &[HeaderPattern] {
        &self.header_patterns
    }

    pub fn is_empty(&self) -> bool {
        self.ip_patterns.is_empty()
            && self.path_patterns.is_empty()
            && self.header_patterns.is_empty()
    }

    /// Resolves the backend `call` should be forwarded to.
    ///
    /// Returns `None` when no pattern matches.
    pub fn resolve(&self, call: &InboundCall<'_>) -> Option<Route<'_>> {
        let by_ip = call.remote_ip().and_then(|ip| {
            self.ip_patterns
                .iter()
                .position(|pattern| pattern.matches(ip))
                .map(|index| (PatternKind::Ip, index, self.ip_patterns[index].destinations()))
        });

        let matched = by_ip
            .or_else(|| {
                self.path_patterns
                    .iter()
                    .position(|pattern| pattern.matches(call.method()))
                    .map(|index| {
                        let dest = self.path_patterns[index].destinations();
                        (PatternKind::Path, index, dest)
                    })
            })
            .or_else(|| {
                self.header_patterns
                    .iter()
                    .position(|pattern| pattern.matches(call))
                    .map(|index| {
                        let dest = self.header_patterns[index].destinations();
                        (PatternKind::Header, index, dest)
                    })
            });

        let (kind, index, dest) = matched?;

        Some(Route {
            kind,
            index,
            destination: self.pick(dest)?,
        })
    }

    fn pick<'a>(&self, dest: &'a [String]) -> Option<&'a str> {
        if dest.is_empty() {
            return None;
        }

        let index = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_range(0..dest.len());

        Some(&dest[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tonic::metadata::{MetadataMap, MetadataValue};

    fn metadata(pairs: &[(&'static str, &str)]) -> MetadataMap {
        let mut metadata = MetadataMap::new();
        for (key, value) in pairs {
            metadata.append(*key, MetadataValue::try_from(*value).unwrap());
        }
        metadata
    }

    fn from_gateway(addr: &str) -> MetadataMap {
        metadata(&[("x-forwarded-remote-addr", addr)])
    }

    #[test]
    fn test_empty_rule_never_matches() {
        let rule = Rule::new();
        let md = from_gateway("192.168.0.1:1949");

        assert!(rule.is_empty());
        assert_eq!(rule.resolve(&InboundCall::new("/svc/Method", None, &md)), None);
    }

    #[test]
    fn test_patterns_require_destinations() {
        let err = IpPattern::new(["10.0.0.0/8"], Vec::<String>::new()).unwrap_err();
        assert_eq!(err, PatternError::NoDestinations(PatternKind::Ip));

        let err = PathPattern::new(["^/svc/"], Vec::<String>::new()).unwrap_err();
        assert_eq!(err, PatternError::NoDestinations(PatternKind::Path));

        let err = HeaderPattern::new([("k", "v")], Vec::<String>::new()).unwrap_err();
        assert_eq!(err, PatternError::NoDestinations(PatternKind::Header));
    }

    #[test]
    fn test_matches_ip_inside_cidr() {
        let rule = Rule::new().with_ip_patterns([IpPattern::new(
            ["192.168.0.1/24"],
            ["10.0.0.5:9000"],
        )
        .unwrap()]);

        let md = from_gateway("192.168.0.1:1949");
        let route = rule.resolve(&InboundCall::new("/svc/Method", None, &md));

        assert_eq!(
            route,
            Some(Route {
                kind: PatternKind::Ip,
                index: 0,
                destination: "10.0.0.5:9000"
            })
        );

        let md = from_gateway("10.0.0.1:1949");
        assert_eq!(rule.resolve(&InboundCall::new("/svc/Method", None, &md)), None);
    }

    #[test]
    fn test_matches_ip_of_transport_peer() {
        let rule =
            Rule::new().with_ip_patterns([IpPattern::new(["127.0.0.0/8"], ["backend"]).unwrap()]);

        let md = MetadataMap::new();
        let peer = "127.0.0.1:40000".parse().ok();

        let route = rule.resolve(&InboundCall::new("/svc/Method", peer, &md)).unwrap();
        assert_eq!(route.kind, PatternKind::Ip);

        assert_eq!(rule.resolve(&InboundCall::new("/svc/Method", None, &md)), None);
    }

    #[test]
    fn test_malformed_cidrs_are_skipped() {
        let rule = Rule::new().with_ip_patterns([
            IpPattern::new(["invalid"], ["first"]).unwrap(),
            IpPattern::new(["invalid", "192.168.0.0/16"], ["second"]).unwrap(),
        ]);

        assert!(rule.ip_patterns()[0].cidrs().is_empty());

        let md = from_gateway("192.168.0.1:1949");
        let route = rule.resolve(&InboundCall::new("/svc/Method", None, &md)).unwrap();

        assert_eq!(route.index, 1);
        assert_eq!(route.destination, "second");
    }

    #[test]
    fn test_path_regexes_use_search_semantics() {
        let rule = Rule::new().with_path_patterns([
            PathPattern::new(["^/Greeter/"], ["10.0.0.6:9000"]).unwrap(),
            PathPattern::new(["Method$"], ["10.0.0.7:9000"]).unwrap(),
        ]);

        let md = MetadataMap::new();

        let route = rule
            .resolve(&InboundCall::new("/Greeter/SayHello", None, &md))
            .unwrap();
        assert_eq!((route.index, route.destination), (0, "10.0.0.6:9000"));

        let route = rule
            .resolve(&InboundCall::new("/Other/Method", None, &md))
            .unwrap();
        assert_eq!((route.index, route.destination), (1, "10.0.0.7:9000"));

        assert_eq!(rule.resolve(&InboundCall::new("/Other/Call", None, &md)), None);
    }

    #[test]
    fn test_invalid_regexes_are_skipped() {
        let pattern = PathPattern::new(["(unclosed", "ut-path"], ["backend"]).unwrap();
        assert_eq!(pattern.paths().collect::<Vec<_>>(), vec!["ut-path"]);

        let rule = Rule::new().with_path_patterns([pattern]);
        let md = MetadataMap::new();

        assert!(rule.resolve(&InboundCall::new("ut-path", None, &md)).is_some());
        assert!(rule.resolve(&InboundCall::new("not-matched", None, &md)).is_none());
    }

    #[test]
    fn test_header_patterns_require_every_pair() {
        let rule = Rule::new().with_header_patterns([HeaderPattern::new(
            [("key-1", "val-1"), ("Key-2", "val-2")],
            ["backend"],
        )
        .unwrap()]);

        let all = metadata(&[("key-1", "val-1"), ("key-2", "val-2"), ("key-3", "val-3")]);
        let route = rule.resolve(&InboundCall::new("/svc/Method", None, &all)).unwrap();
        assert_eq!(route.kind, PatternKind::Header);

        let partial = metadata(&[("key-1", "val-1")]);
        assert_eq!(rule.resolve(&InboundCall::new("/svc/Method", None, &partial)), None);

        let wrong_value = metadata(&[("key-1", "val-1"), ("key-2", "other")]);
        assert_eq!(
            rule.resolve(&InboundCall::new("/svc/Method", None, &wrong_value)),
            None
        );

        assert_eq!(
            rule.resolve(&InboundCall::new("/svc/Method", None, &MetadataMap::new())),
            None
        );
    }

    #[test]
    fn test_header_values_are_searched_among_all_values() {
        let rule = Rule::new()
            .with_header_patterns([HeaderPattern::new([("tenant", "b")], ["backend"]).unwrap()]);

        let md = metadata(&[("tenant", "a"), ("tenant", "b")]);
        assert!(rule.resolve(&InboundCall::new("/svc/Method", None, &md)).is_some());
    }

    #[test]
    fn test_header_pattern_without_pairs_never_matches() {
        let rule = Rule::new().with_header_patterns([HeaderPattern::new(
            Vec::<(String, String)>::new(),
            ["backend"],
        )
        .unwrap()]);

        let md = metadata(&[("key-1", "val-1")]);
        assert_eq!(rule.resolve(&InboundCall::new("/svc/Method", None, &md)), None);
    }

    #[test]
    fn test_ip_wins_over_path_and_path_wins_over_header() {
        let rule = Rule::new()
            .with_header_patterns([HeaderPattern::new([("env", "dev")], ["by-header"]).unwrap()])
            .with_path_patterns([PathPattern::new(["^/Greeter/"], ["by-path"]).unwrap()])
            .with_ip_patterns([IpPattern::new(["192.168.0.0/24"], ["by-ip"]).unwrap()]);

        let md = metadata(&[("x-forwarded-remote-addr", "192.168.0.1:1949"), ("env", "dev")]);
        let route = rule
            .resolve(&InboundCall::new("/Greeter/SayHello", None, &md))
            .unwrap();
        assert_eq!(route.destination, "by-ip");

        let md = metadata(&[("x-forwarded-remote-addr", "10.9.9.9:1949"), ("env", "dev")]);
        let route = rule
            .resolve(&InboundCall::new("/Greeter/SayHello", None, &md))
            .unwrap();
        assert_eq!(route.destination, "by-path");

        let route = rule
            .resolve(&InboundCall::new("/Other/Method", None, &md))
            .unwrap();
        assert_eq!(route.destination, "by-header");
    }

    #[test]
    fn test_first_declared_pattern_wins() {
        let rule = Rule::new().with_path_patterns([
            PathPattern::new(["Greeter"], ["first"]).unwrap(),
            PathPattern::new(["^/Greeter/SayHello$"], ["second"]).unwrap(),
        ]);

        let md = MetadataMap::new();
        let route = rule
            .resolve(&InboundCall::new("/Greeter/SayHello", None, &md))
            .unwrap();

        assert_eq!(route.destination, "first");
    }

    #[test]
    fn test_repeated_resolution_hits_the_same_pattern() {
        let rule = Rule::with_seed(7).with_path_patterns([
            PathPattern::new(["^/Other/"], ["x"]).unwrap(),
            PathPattern::new(["^/Greeter/"], ["a", "b", "c"]).unwrap(),
        ]);

        let md = MetadataMap::new();
        let call = InboundCall::new("/Greeter/SayHello", None, &md);

        for _ in 0..50 {
            let route = rule.resolve(&call).unwrap();
            assert_eq!((route.kind, route.index), (PatternKind::Path, 1));
            assert!(["a", "b", "c"].contains(&route.destination));
        }
    }

    #[test]
    fn test_destinations_are_picked_roughly_uniformly() {
        let dest = ["a", "b", "c", "d"];
        let rule = Rule::with_seed(42)
            .with_path_patterns([PathPattern::new([".*"], dest).unwrap()]);

        let md = MetadataMap::new();
        let call = InboundCall::new("/svc/Method", None, &md);

        let trials = 8_000;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for _ in 0..trials {
            *counts.entry(rule.resolve(&call).unwrap().destination).or_default() += 1;
        }

        let expected = trials / dest.len();
        for candidate in dest {
            let seen = counts.get(candidate).copied().unwrap_or_default();
            assert!(
                seen.abs_diff(expected) < expected / 5,
                "'{candidate}' picked {seen} times, expected about {expected}"
            );
        }
    }
}
