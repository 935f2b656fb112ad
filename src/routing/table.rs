//! Route table.
//!
//! # Responsibilities
//! - Store compiled routes in registration order
//! - Look up the first route matching a request's host and path
//! - Resolve fallback routes by id
//!
//! # Design Decisions
//! - Immutable after construction; reloads build a new table and swap it
//! - O(n) ordered scan, first match wins
//! - Explicit `RouteNotFound` rather than a silent default route

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::uri::{Authority, PathAndQuery};
use axum::http::{header, HeaderValue, Response, StatusCode, Uri};
use thiserror::Error;

use crate::config::schema::{CircuitBreakerConfig, PathMatch, ProxyConfig, RouteConfig, StaticResponseConfig};
use crate::routing::filter::FilterSpec;
use crate::routing::matcher::{normalize_host, HostMatcher, Matcher, PathMatcher, RoutePredicate};

/// Upstream URI of routes answered by the gateway itself.
pub const STATIC_SCHEME: &str = "static:";

/// Route table construction failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteTableError {
    #[error("duplicate route id '{0}'")]
    DuplicateRouteId(String),

    #[error("route '{0}' needs a host or path predicate")]
    MissingPredicate(String),

    #[error("route '{0}' has an empty upstream uri")]
    EmptyUpstream(String),

    #[error("route '{route}': invalid upstream: {reason}")]
    InvalidUpstream { route: String, reason: String },

    #[error("route '{route}': invalid host pattern '{pattern}'")]
    InvalidHost { route: String, pattern: String },

    #[error("route '{route}': invalid filter: {reason}")]
    InvalidFilter { route: String, reason: String },

    #[error("route '{route}': fallback route '{fallback}' does not exist")]
    UnknownFallback { route: String, fallback: String },

    #[error("route '{route}': fallback route '{fallback}' must not be circuit breaker guarded")]
    GuardedFallback { route: String, fallback: String },
}

/// No route matched the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no route matches host {host:?} path '{path}'")]
pub struct RouteNotFound {
    pub host: Option<String>,
    pub path: String,
}

/// Fixed response served without contacting any upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: HeaderValue,
}

impl StaticResponse {
    fn from_config(config: Option<&StaticResponseConfig>) -> Result<Self, String> {
        let Some(config) = config else {
            return Ok(Self {
                status: StatusCode::OK,
                body: Bytes::new(),
                content_type: HeaderValue::from_static("text/plain; charset=utf-8"),
            });
        };

        let status = StatusCode::from_u16(config.status).map_err(|e| e.to_string())?;
        let content_type = match &config.content_type {
            Some(ct) => HeaderValue::from_str(ct).map_err(|e| e.to_string())?,
            None => HeaderValue::from_static("text/plain; charset=utf-8"),
        };
        Ok(Self {
            status,
            body: Bytes::from(config.body.clone()),
            content_type,
        })
    }

    pub fn to_response(&self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = self.status;
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, self.content_type.clone());
        response
    }
}

/// An `http://authority[/base]` upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpUpstream {
    authority: Authority,
    base_path: String,
}

impl HttpUpstream {
    pub fn parse(uri: &str) -> Result<Self, String> {
        let uri: Uri = uri.parse().map_err(|e: axum::http::uri::InvalidUri| e.to_string())?;
        if uri.scheme_str() != Some("http") {
            return Err("only http upstreams are supported".to_string());
        }
        let authority = uri.authority().cloned().ok_or("missing host")?;
        if uri.query().is_some() {
            return Err("query is not allowed".to_string());
        }
        Ok(Self {
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Target URI: the base path followed by the original path and query.
    pub fn target_uri(&self, original: &Uri) -> Result<Uri, axum::http::Error> {
        let suffix = original
            .path_and_query()
            .map(PathAndQuery::as_str)
            .unwrap_or("/");
        let path_and_query = format!("{}{}", self.base_path, suffix);

        Uri::builder()
            .scheme("http")
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }
}

/// Where a route sends matched requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    Http(HttpUpstream),
    Static(StaticResponse),
}

/// A compiled route.
#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub predicate: RoutePredicate,
    pub filters: Vec<FilterSpec>,
    pub upstream: Upstream,
}

impl Route {
    /// Compile a configured route.
    pub fn from_config(config: &RouteConfig, proxy: &ProxyConfig) -> Result<Self, RouteTableError> {
        let host = config
            .host
            .as_deref()
            .map(|pattern| {
                HostMatcher::new(pattern).map_err(|_| RouteTableError::InvalidHost {
                    route: config.id.clone(),
                    pattern: pattern.to_string(),
                })
            })
            .transpose()?;

        let path = config.path.as_ref().map(|path| match config.path_match {
            PathMatch::Prefix => PathMatcher::Prefix(path.clone()),
            PathMatch::Exact => PathMatcher::Exact(path.clone()),
        });

        let uri = config.uri.trim();
        if uri.is_empty() {
            return Err(RouteTableError::EmptyUpstream(config.id.clone()));
        }
        let upstream = match uri {
            STATIC_SCHEME => StaticResponse::from_config(config.response.as_ref()).map(Upstream::Static),
            _ => HttpUpstream::parse(uri).map(Upstream::Http),
        }
        .map_err(|reason| RouteTableError::InvalidUpstream {
            route: config.id.clone(),
            reason,
        })?;

        let filters = config
            .filters
            .iter()
            .map(|filter| {
                FilterSpec::from_config(filter, &proxy.key_resolvers).map_err(|e| RouteTableError::InvalidFilter {
                    route: config.id.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: config.id.clone(),
            predicate: RoutePredicate::new(host, path),
            filters,
            upstream,
        })
    }

    /// The route's circuit breaker settings, if it is guarded.
    pub fn circuit_breaker(&self) -> Option<&CircuitBreakerConfig> {
        self.filters.iter().find_map(|filter| match filter {
            FilterSpec::CircuitBreak(config) => Some(config),
            _ => None,
        })
    }
}

/// Ordered, immutable set of routes.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
    by_id: HashMap<String, usize>,
}

impl RouteTable {
    /// Build a table, checking ids, predicates and fallback references.
    pub fn new(routes: Vec<Route>) -> Result<Self, RouteTableError> {
        let mut by_id = HashMap::with_capacity(routes.len());
        for (index, route) in routes.iter().enumerate() {
            if route.predicate.is_empty() {
                return Err(RouteTableError::MissingPredicate(route.id.clone()));
            }
            if by_id.insert(route.id.clone(), index).is_some() {
                return Err(RouteTableError::DuplicateRouteId(route.id.clone()));
            }
        }

        for route in &routes {
            let Some(fallback) = route.circuit_breaker().and_then(|cb| cb.fallback.as_ref()) else {
                continue;
            };
            match by_id.get(fallback) {
                None => {
                    return Err(RouteTableError::UnknownFallback {
                        route: route.id.clone(),
                        fallback: fallback.clone(),
                    })
                }
                Some(&index) if routes[index].circuit_breaker().is_some() => {
                    return Err(RouteTableError::GuardedFallback {
                        route: route.id.clone(),
                        fallback: fallback.clone(),
                    })
                }
                Some(_) => {}
            }
        }

        Ok(Self {
            routes: routes.into_iter().map(Arc::new).collect(),
            by_id,
        })
    }

    /// Compile every configured route.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, RouteTableError> {
        let routes = config
            .routes
            .iter()
            .map(|route| Route::from_config(route, config))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(routes)
    }

    /// First route whose predicate matches. `host` is the raw Host value.
    pub fn match_route(&self, host: Option<&str>, path: &str) -> Result<Arc<Route>, RouteNotFound> {
        let host = host.and_then(normalize_host);
        self.routes
            .iter()
            .find(|route| route.predicate.matches(host.as_deref(), path))
            .cloned()
            .ok_or_else(|| RouteNotFound {
                host,
                path: path.to_string(),
            })
    }

    pub fn get(&self, id: &str) -> Option<Arc<Route>> {
        self.by_id.get(id).map(|&index| Arc::clone(&self.routes[index]))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// `(route id, breaker settings)` of every guarded route.
    pub fn guarded(&self) -> impl Iterator<Item = (&str, &CircuitBreakerConfig)> {
        self.routes
            .iter()
            .filter_map(|route| route.circuit_breaker().map(|cb| (route.id.as_str(), cb)))
    }
}
