//! Rate-limit key resolution.
//!
//! A key resolver turns request identity attributes into the string that
//! names a token bucket. Resolvers are pure functions of the request; when the
//! attribute is missing the configured default key is used instead.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, Uri};

use crate::config::schema::{KeyResolverConfig, KeySourceKind};

/// The parts of a request a resolver may look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestIdentity<'a> {
    pub headers: &'a HeaderMap,
    pub uri: &'a Uri,
    pub client_addr: Option<SocketAddr>,
}

/// Derives a rate-limit key from a request.
pub trait KeyResolver: Send + Sync + fmt::Debug {
    /// Returns `None` when the request does not carry the attribute.
    fn resolve(&self, request: &RequestIdentity<'_>) -> Option<String>;
}

/// Always the same key, shared by every caller.
#[derive(Debug, Clone)]
pub struct ConstantKey(pub String);

impl KeyResolver for ConstantKey {
    fn resolve(&self, _request: &RequestIdentity<'_>) -> Option<String> {
        Some(self.0.clone())
    }
}

/// First value of a request header.
#[derive(Debug, Clone)]
pub struct HeaderKey(pub HeaderName);

impl KeyResolver for HeaderKey {
    fn resolve(&self, request: &RequestIdentity<'_>) -> Option<String> {
        request
            .headers
            .get(&self.0)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
    }
}

/// First value of a query parameter.
#[derive(Debug, Clone)]
pub struct QueryKey(pub String);

impl KeyResolver for QueryKey {
    fn resolve(&self, request: &RequestIdentity<'_>) -> Option<String> {
        let query = request.uri.query()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(name, _)| name == self.0.as_str())
            .map(|(_, value)| value.into_owned())
    }
}

/// Peer IP address of the connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIpKey;

impl KeyResolver for ClientIpKey {
    fn resolve(&self, request: &RequestIdentity<'_>) -> Option<String> {
        request.client_addr.map(|addr| addr.ip().to_string())
    }
}

/// A named resolver together with its default key.
#[derive(Debug, Clone)]
pub struct KeyResolverRef {
    name: String,
    resolver: Arc<dyn KeyResolver>,
    default_key: String,
}

impl KeyResolverRef {
    pub fn new(name: impl Into<String>, resolver: Arc<dyn KeyResolver>, default_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resolver,
            default_key: default_key.into(),
        }
    }

    /// Resolver used by rate-limit filters that do not name one.
    pub fn client_ip() -> Self {
        Self::new("client_ip", Arc::new(ClientIpKey), "anonymous")
    }

    /// Build a resolver from its configuration entry.
    ///
    /// Returns `None` if the entry is incomplete; validation reports that case.
    pub fn from_config(name: &str, config: &KeyResolverConfig) -> Option<Self> {
        let resolver: Arc<dyn KeyResolver> = match config.kind {
            KeySourceKind::Constant => Arc::new(ConstantKey(config.value.clone()?)),
            KeySourceKind::Header => {
                let header = HeaderName::from_bytes(config.name.as_deref()?.as_bytes()).ok()?;
                Arc::new(HeaderKey(header))
            }
            KeySourceKind::Query => Arc::new(QueryKey(config.name.clone()?)),
            KeySourceKind::ClientIp => Arc::new(ClientIpKey),
        };
        Some(Self::new(name, resolver, config.default_key.clone()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve the bucket key, falling back to the default key.
    pub fn key(&self, request: &RequestIdentity<'_>) -> String {
        match self.resolver.resolve(request) {
            Some(key) if !key.is_empty() => key,
            _ => self.default_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn identity<'a>(headers: &'a HeaderMap, uri: &'a Uri, addr: Option<SocketAddr>) -> RequestIdentity<'a> {
        RequestIdentity {
            headers,
            uri,
            client_addr: addr,
        }
    }

    #[test]
    fn test_query_resolver() {
        let headers = HeaderMap::new();
        let uri: Uri = "/anything?foo=bar&user=alice%20b".parse().unwrap();
        let resolver = KeyResolverRef::new("user", Arc::new(QueryKey("user".into())), "anonymous");
        assert_eq!(resolver.key(&identity(&headers, &uri, None)), "alice b");

        let uri: Uri = "/anything?foo=bar".parse().unwrap();
        assert_eq!(resolver.key(&identity(&headers, &uri, None)), "anonymous");
    }

    #[test]
    fn test_header_resolver_and_empty_values() {
        let mut headers = HeaderMap::new();
        let uri: Uri = "/".parse().unwrap();
        let resolver = KeyResolverRef::new(
            "api_key",
            Arc::new(HeaderKey(HeaderName::from_static("x-api-key"))),
            "no-key",
        );
        assert_eq!(resolver.key(&identity(&headers, &uri, None)), "no-key");

        headers.insert("x-api-key", HeaderValue::from_static("k-123"));
        assert_eq!(resolver.key(&identity(&headers, &uri, None)), "k-123");

        headers.insert("x-api-key", HeaderValue::from_static(""));
        assert_eq!(resolver.key(&identity(&headers, &uri, None)), "no-key");
    }

    #[test]
    fn test_client_ip_and_constant() {
        let headers = HeaderMap::new();
        let uri: Uri = "/".parse().unwrap();
        let addr: SocketAddr = "10.1.2.3:5555".parse().unwrap();

        let ip = KeyResolverRef::client_ip();
        assert_eq!(ip.key(&identity(&headers, &uri, Some(addr))), "10.1.2.3");
        assert_eq!(ip.key(&identity(&headers, &uri, None)), "anonymous");

        let constant = KeyResolverRef::from_config(
            "throttle",
            &KeyResolverConfig {
                kind: KeySourceKind::Constant,
                name: None,
                value: Some("throttle".into()),
                default_key: "anonymous".into(),
            },
        )
        .unwrap();
        assert_eq!(constant.name(), "throttle");
        assert_eq!(constant.key(&identity(&headers, &uri, Some(addr))), "throttle");
    }
}
