//! Route matching logic.
//!
//! # Responsibilities
//! - Match host (glob, case-insensitive, port ignored)
//! - Match path (segment-aware prefix or exact, case-sensitive)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Host matching is case-insensitive (RFC 9110)
//! - Path matching is case-sensitive
//! - Empty condition = always matches (wildcard)
//! - `*` matches within a single host label, so `*.example.com` does not
//!   match `a.b.example.com`
//! - No regex to guarantee O(n) matching

use std::fmt;

/// Trait for matching a request's host and path against conditions.
pub trait Matcher: Send + Sync + fmt::Debug {
    /// Returns true if the request matches this condition.
    ///
    /// `host` is the normalized host (see [`normalize_host`]).
    fn matches(&self, host: Option<&str>, path: &str) -> bool;
}

/// Rejected host pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidHostPattern(pub String);

impl fmt::Display for InvalidHostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid host pattern '{}'", self.0)
    }
}

impl std::error::Error for InvalidHostPattern {}

/// Lowercase a Host header value and strip its port and trailing dot.
///
/// Returns `None` for values that cannot name a host.
pub fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let host = if let Some(rest) = raw.strip_prefix('[') {
        // IPv6 literal: "[::1]:8080"
        let end = rest.find(']')?;
        &rest[..end]
    } else {
        match raw.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => raw,
        }
    };
    let host = host.trim_end_matches('.');
    if host.is_empty() {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

/// Matches the host against a glob such as `*.example.com`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMatcher {
    labels: Vec<String>,
}

impl HostMatcher {
    /// Compile a host glob. The pattern is normalized to lowercase.
    pub fn new(pattern: impl Into<String>) -> Result<Self, InvalidHostPattern> {
        let pattern = pattern.into();
        let normalized = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
        let labels: Vec<String> = normalized.split('.').map(str::to_string).collect();

        let valid = !normalized.is_empty()
            && labels.iter().all(|label| {
                !label.is_empty()
                    && label
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '*'))
            });
        if !valid {
            return Err(InvalidHostPattern(pattern));
        }

        Ok(Self { labels })
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, host: Option<&str>, _path: &str) -> bool {
        let Some(host) = host else {
            return false;
        };
        let mut labels = host.split('.');
        for pattern in &self.labels {
            match labels.next() {
                Some(label) if !label.is_empty() && glob_label(pattern.as_bytes(), label.as_bytes()) => {}
                _ => return false,
            }
        }
        labels.next().is_none()
    }
}

/// Wildcard match of one label; `*` matches any run of characters.
fn glob_label(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// Matches the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatcher {
    /// Segment-aware prefix.
    Prefix(String),
    /// Whole-path equality.
    Exact(String),
}

impl Matcher for PathMatcher {
    fn matches(&self, _host: Option<&str>, path: &str) -> bool {
        match self {
            PathMatcher::Exact(expected) => path == expected,
            PathMatcher::Prefix(prefix) => match path.strip_prefix(prefix.as_str()) {
                Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
                None => false,
            },
        }
    }
}

/// A route predicate: host AND path, each optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePredicate {
    pub host: Option<HostMatcher>,
    pub path: Option<PathMatcher>,
}

impl RoutePredicate {
    pub fn new(host: Option<HostMatcher>, path: Option<PathMatcher>) -> Self {
        Self { host, path }
    }

    /// True when neither a host nor a path condition is set.
    pub fn is_empty(&self) -> bool {
        self.host.is_none() && self.path.is_none()
    }
}

impl Matcher for RoutePredicate {
    fn matches(&self, host: Option<&str>, path: &str) -> bool {
        self.host.as_ref().map_or(true, |m| m.matches(host, path))
            && self.path.as_ref().map_or(true, |m| m.matches(host, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Example.COM:8080").as_deref(), Some("example.com"));
        assert_eq!(normalize_host("www.hystrix.com.").as_deref(), Some("www.hystrix.com"));
        assert_eq!(normalize_host("[::1]:80").as_deref(), Some("::1"));
        assert_eq!(normalize_host(":80"), None);
        assert_eq!(normalize_host(""), None);
    }

    #[test]
    fn test_host_matcher() {
        let matcher = HostMatcher::new("*.Hystrix.com").unwrap();

        assert!(matcher.matches(Some("www.hystrix.com"), "/"));
        assert!(matcher.matches(Some("foo.hystrix.com"), "/"));
        assert!(!matcher.matches(Some("hystrix.com"), "/"));
        assert!(!matcher.matches(Some("a.b.hystrix.com"), "/"));
        assert!(!matcher.matches(Some("www.throttle.com"), "/"));
        assert!(!matcher.matches(None, "/"));

        let exact = HostMatcher::new("example.com").unwrap();
        assert!(exact.matches(Some("example.com"), "/"));
        assert!(!exact.matches(Some("example.com.au"), "/"));

        let partial = HostMatcher::new("api-*.example.com").unwrap();
        assert!(partial.matches(Some("api-eu.example.com"), "/"));
        assert!(!partial.matches(Some("web-eu.example.com"), "/"));
    }

    #[test]
    fn test_invalid_host_patterns() {
        assert!(HostMatcher::new("").is_err());
        assert!(HostMatcher::new("bad..host").is_err());
        assert!(HostMatcher::new("spaces are.bad").is_err());
    }

    #[test]
    fn test_path_matcher() {
        let prefix = PathMatcher::Prefix("/api".into());
        assert!(prefix.matches(None, "/api"));
        assert!(prefix.matches(None, "/api/v1"));
        assert!(!prefix.matches(None, "/apiv1"));
        assert!(!prefix.matches(None, "/images"));

        let root = PathMatcher::Prefix("/".into());
        assert!(root.matches(None, "/anything"));

        let exact = PathMatcher::Exact("/get".into());
        assert!(exact.matches(None, "/get"));
        assert!(!exact.matches(None, "/get/1"));
        assert!(!exact.matches(None, "/GET"));
    }

    #[test]
    fn test_predicate_and_semantics() {
        let predicate = RoutePredicate::new(
            Some(HostMatcher::new("*.example.com").unwrap()),
            Some(PathMatcher::Prefix("/api".into())),
        );
        assert!(predicate.matches(Some("www.example.com"), "/api/x"));
        assert!(!predicate.matches(Some("www.example.com"), "/web"));
        assert!(!predicate.matches(Some("other.org"), "/api"));

        let path_only = RoutePredicate::new(None, Some(PathMatcher::Exact("/get".into())));
        assert!(path_only.matches(None, "/get"));
        assert!(path_only.matches(Some("anything.io"), "/get"));
    }
}
